use axum::{
    Router,
    extract::{Json, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::{
    DEFAULT_MIN_BATCH_SIZE, DEFAULT_MONTHLY_INCOME_RATE, DEFAULT_RETIREMENT_RETURN,
    DEFAULT_RETIREMENT_VOLATILITY_FACTOR, DEFAULT_SEQUENTIAL_THRESHOLD, DEFAULT_SIMULATIONS,
    DEFAULT_UNIT_TIMEOUT, DEFAULT_YIELD_INTERVAL, DeterministicProjector, EngineSettings,
    InvestorProfile, JumpDiffusion, NoiseKind, ProfileParameters, RetirementVolatility,
    ScenarioBands, SimulationConfig, SimulationEngine, SimulationError, SimulationResult,
    Trajectory, required_monthly_contribution, sustainable_monthly_income,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliNoise {
    Gaussian,
    Laplace,
}

impl From<CliNoise> for NoiseKind {
    fn from(value: CliNoise) -> Self {
        match value {
            CliNoise::Gaussian => NoiseKind::Gaussian,
            CliNoise::Laplace => NoiseKind::Laplace,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliRetirementVolatility {
    Scaled,
    ReturnLinked,
    Fixed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliBands {
    Wide,
    Interquartile,
}

impl From<CliBands> for ScenarioBands {
    fn from(value: CliBands) -> Self {
        match value {
            CliBands::Wide => ScenarioBands::Wide,
            CliBands::Interquartile => ScenarioBands::Interquartile,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiNoise {
    Gaussian,
    Laplace,
}

impl From<ApiNoise> for CliNoise {
    fn from(value: ApiNoise) -> Self {
        match value {
            ApiNoise::Gaussian => CliNoise::Gaussian,
            ApiNoise::Laplace => CliNoise::Laplace,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiRetirementVolatility {
    Scaled,
    ReturnLinked,
    Fixed,
}

impl From<ApiRetirementVolatility> for CliRetirementVolatility {
    fn from(value: ApiRetirementVolatility) -> Self {
        match value {
            ApiRetirementVolatility::Scaled => CliRetirementVolatility::Scaled,
            ApiRetirementVolatility::ReturnLinked => CliRetirementVolatility::ReturnLinked,
            ApiRetirementVolatility::Fixed => CliRetirementVolatility::Fixed,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiBands {
    Wide,
    Interquartile,
}

impl From<ApiBands> for CliBands {
    fn from(value: ApiBands) -> Self {
        match value {
            ApiBands::Wide => CliBands::Wide,
            ApiBands::Interquartile => CliBands::Interquartile,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    initial_amount: Option<f64>,
    monthly_contribution: Option<f64>,
    accumulation_years: Option<u32>,
    total_years: Option<u32>,
    simulation_count: Option<u32>,
    seed: Option<u64>,

    profile: Option<String>,
    expected_return: Option<f64>,
    volatility: Option<f64>,
    noise: Option<ApiNoise>,

    monthly_income_rate: Option<f64>,
    retirement_monthly_income: Option<f64>,
    retirement_annual_return: Option<f64>,
    retirement_volatility: Option<ApiRetirementVolatility>,
    retirement_volatility_value: Option<f64>,

    jump_diffusion: Option<bool>,
    crisis_frequency: Option<f64>,
    crisis_mean_impact: Option<f64>,
    crisis_volatility: Option<f64>,

    scenario_bands: Option<ApiBands>,
    include_paths: Option<bool>,
    target_wealth: Option<f64>,
}

#[derive(Parser, Debug)]
#[command(
    name = "nestegg",
    version,
    about = "Monte Carlo retirement wealth simulator (GBM with optional crisis jumps)"
)]
pub struct Cli {
    #[command(flatten)]
    engine: EngineArgs,
    /// Used when RUST_LOG is unset.
    #[arg(long, global = true, env = "NESTEGG_LOG_LEVEL", default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Command,
}

impl Cli {
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one simulation and print the JSON result to stdout.
    Simulate(SimulateArgs),
    /// Serve the HTTP API.
    Serve {
        #[arg(long, env = "NESTEGG_PORT", default_value_t = 8080)]
        port: u16,
    },
    /// Print the investor profile table.
    Profiles,
}

#[derive(Args, Debug, Clone)]
struct EngineArgs {
    #[arg(
        long,
        global = true,
        env = "NESTEGG_MAX_UNITS",
        help = "Concurrent simulation units; defaults to min(cpus, 8)"
    )]
    max_units: Option<usize>,
    #[arg(long, global = true, env = "NESTEGG_MIN_BATCH_SIZE", default_value_t = DEFAULT_MIN_BATCH_SIZE)]
    min_batch_size: usize,
    #[arg(
        long,
        global = true,
        env = "NESTEGG_UNIT_TIMEOUT_SECS",
        default_value_t = DEFAULT_UNIT_TIMEOUT.as_secs()
    )]
    unit_timeout_secs: u64,
    #[arg(
        long,
        global = true,
        env = "NESTEGG_SEQUENTIAL_THRESHOLD",
        default_value_t = DEFAULT_SEQUENTIAL_THRESHOLD,
        help = "Simulation counts below this run on a single task"
    )]
    sequential_threshold: usize,
    #[arg(long, global = true, env = "NESTEGG_YIELD_INTERVAL", default_value_t = DEFAULT_YIELD_INTERVAL)]
    yield_interval: usize,
}

impl EngineArgs {
    fn settings(&self) -> EngineSettings {
        let defaults = EngineSettings::default();
        EngineSettings {
            max_units: self.max_units.unwrap_or(defaults.max_units).max(1),
            min_batch_size: self.min_batch_size,
            unit_timeout: Duration::from_secs(self.unit_timeout_secs.max(1)),
            sequential_threshold: self.sequential_threshold,
            yield_interval: self.yield_interval.max(1),
        }
    }
}

#[derive(Args, Debug, Clone)]
struct SimulateArgs {
    #[arg(long, default_value_t = 100_000.0)]
    initial_amount: f64,
    #[arg(long, default_value_t = 1_000.0)]
    monthly_contribution: f64,
    #[arg(long, default_value_t = 25)]
    accumulation_years: u32,
    #[arg(long, default_value_t = 55)]
    total_years: u32,
    #[arg(long = "simulations", default_value_t = DEFAULT_SIMULATIONS)]
    simulation_count: u32,
    #[arg(long, help = "Base seed; drawn at random and reported when omitted")]
    seed: Option<u64>,

    #[arg(
        long,
        default_value = "moderate",
        help = "conservative|moderate|aggressive (also conservador|moderado|arrojado)"
    )]
    profile: InvestorProfile,
    #[arg(
        long,
        allow_negative_numbers = true,
        help = "Annual return; overrides the profile"
    )]
    expected_return: Option<f64>,
    #[arg(long, help = "Annual volatility; overrides the profile")]
    volatility: Option<f64>,
    #[arg(long, value_enum, default_value_t = CliNoise::Gaussian)]
    noise: CliNoise,

    #[arg(
        long,
        default_value_t = DEFAULT_MONTHLY_INCOME_RATE,
        help = "Monthly withdrawal as a share of wealth at retirement, used when no fixed income is set"
    )]
    monthly_income_rate: f64,
    #[arg(long, default_value_t = 0.0)]
    retirement_monthly_income: f64,
    #[arg(long, allow_negative_numbers = true, default_value_t = DEFAULT_RETIREMENT_RETURN)]
    retirement_annual_return: f64,
    #[arg(long, value_enum, default_value_t = CliRetirementVolatility::Scaled)]
    retirement_volatility: CliRetirementVolatility,
    #[arg(
        long,
        default_value_t = DEFAULT_RETIREMENT_VOLATILITY_FACTOR,
        help = "Damping factor in scaled mode, volatility in fixed mode"
    )]
    retirement_volatility_value: f64,

    #[arg(long)]
    jump_diffusion: bool,
    #[arg(long, default_value_t = 0.1, help = "Expected crises per year")]
    crisis_frequency: f64,
    #[arg(long, allow_negative_numbers = true, default_value_t = -0.15)]
    crisis_mean_impact: f64,
    #[arg(long, default_value_t = 0.1)]
    crisis_volatility: f64,

    #[arg(long, value_enum, default_value_t = CliBands::Wide)]
    bands: CliBands,
    #[arg(long)]
    include_paths: bool,
    #[arg(long, help = "Goal wealth at retirement; reports the monthly contribution it needs")]
    target_wealth: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    profile: InvestorProfile,
    expected_return: f64,
    volatility: f64,
    #[serde(flatten)]
    result: SimulationResult,
    /// Noise-free projection with the same cashflows.
    baseline: Trajectory,
    /// Level income that would exhaust the median retirement balance by the horizon.
    sustainable_monthly_income: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    required_monthly_contribution: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    active_units: usize,
}

#[derive(Clone)]
struct AppState {
    engine: Arc<SimulationEngine>,
    projector: Arc<Mutex<DeterministicProjector>>,
}

impl AppState {
    fn new(settings: EngineSettings) -> Self {
        Self {
            engine: Arc::new(SimulationEngine::new(settings)),
            projector: Arc::new(Mutex::new(DeterministicProjector::default())),
        }
    }

    fn project(&self, config: &SimulationConfig) -> Trajectory {
        self.projector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .project(config)
    }
}

pub async fn run(cli: Cli) -> ExitCode {
    let settings = cli.engine.settings();
    match cli.command {
        Command::Serve { port } => match run_http_server(port, settings).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "server error");
                ExitCode::FAILURE
            }
        },
        Command::Simulate(args) => match simulate_to_json(&args, settings).await {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(msg) => {
                eprintln!("{msg}");
                ExitCode::FAILURE
            }
        },
        Command::Profiles => match serde_json::to_string_pretty(&profile_table()) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        },
    }
}

async fn simulate_to_json(args: &SimulateArgs, settings: EngineSettings) -> Result<String, String> {
    let config = build_config(args)?;
    let state = AppState::new(settings);
    let cancel = CancellationToken::new();

    let outcome = tokio::select! {
        outcome = state.engine.run(&config, &cancel) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, abandoning simulation");
            Err(SimulationError::Cancelled)
        }
    };
    let result = outcome.map_err(|e| e.to_string())?;
    let response = build_simulate_response(&state, args, &config, result);
    serde_json::to_string_pretty(&response).map_err(|e| format!("Failed to encode result: {e}"))
}

fn build_config(args: &SimulateArgs) -> Result<SimulationConfig, String> {
    let profile = args.profile.parameters();
    let retirement_volatility = match args.retirement_volatility {
        CliRetirementVolatility::Scaled => RetirementVolatility::Scaled(args.retirement_volatility_value),
        CliRetirementVolatility::ReturnLinked => RetirementVolatility::ReturnLinked,
        CliRetirementVolatility::Fixed => RetirementVolatility::Fixed(args.retirement_volatility_value),
    };
    let jump = args.jump_diffusion.then_some(JumpDiffusion {
        frequency: args.crisis_frequency,
        mean_impact: args.crisis_mean_impact,
        impact_volatility: args.crisis_volatility,
    });

    if let Some(target) = args.target_wealth {
        if !target.is_finite() || target < 0.0 {
            return Err("--target-wealth must be a finite value >= 0".to_string());
        }
    }

    let config = SimulationConfig {
        initial_amount: args.initial_amount,
        monthly_contribution: args.monthly_contribution,
        accumulation_years: args.accumulation_years,
        total_years: args.total_years,
        expected_return: args.expected_return.unwrap_or(profile.annual_return),
        volatility: args.volatility.unwrap_or(profile.volatility),
        monthly_income_rate: args.monthly_income_rate,
        retirement_monthly_income: args.retirement_monthly_income,
        retirement_annual_return: args.retirement_annual_return,
        simulation_count: args.simulation_count,
        jump,
        noise: args.noise.into(),
        retirement_volatility,
        scenario_bands: args.bands.into(),
        include_paths: args.include_paths,
        seed: args.seed,
    };
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn build_simulate_response(
    state: &AppState,
    args: &SimulateArgs,
    config: &SimulationConfig,
    result: SimulationResult,
) -> SimulateResponse {
    let retirement_year = config.accumulation_years as usize;
    let median_at_retirement = result
        .statistics
        .percentile50
        .get(retirement_year)
        .copied()
        .unwrap_or(0.0);

    SimulateResponse {
        profile: args.profile,
        expected_return: config.expected_return,
        volatility: config.volatility,
        baseline: state.project(config),
        sustainable_monthly_income: sustainable_monthly_income(
            median_at_retirement,
            config.retirement_annual_return,
            config.decumulation_years(),
        ),
        required_monthly_contribution: args.target_wealth.map(|goal| {
            required_monthly_contribution(
                config.initial_amount,
                goal,
                config.accumulation_years,
                config.expected_return,
            )
        }),
        result,
    }
}

fn profile_table() -> Vec<ProfileParameters> {
    InvestorProfile::ALL.iter().map(|p| p.parameters()).collect()
}

pub async fn run_http_server(port: u16, settings: EngineSettings) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(AppState::new(settings));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "nestegg HTTP API listening");
    info!("Local access: http://127.0.0.1:{port}/api/simulate");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .route("/api/profiles", get(profiles_handler))
        .route("/health", get(health_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn health_handler(State(state): State<AppState>) -> Response {
    json_response(
        StatusCode::OK,
        HealthResponse {
            status: "ok",
            active_units: state.engine.active_units(),
        },
    )
}

async fn profiles_handler() -> Response {
    json_response(StatusCode::OK, profile_table())
}

async fn simulate_get_handler(
    State(state): State<AppState>,
    Query(payload): Query<SimulatePayload>,
) -> Response {
    simulate_handler_impl(state, payload).await
}

async fn simulate_post_handler(
    State(state): State<AppState>,
    Json(payload): Json<SimulatePayload>,
) -> Response {
    simulate_handler_impl(state, payload).await
}

async fn simulate_handler_impl(state: AppState, payload: SimulatePayload) -> Response {
    let args = match api_request_from_payload(payload) {
        Ok(args) => args,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let config = match build_config(&args)
        .and_then(|config| within_http_budget(&config).map(|()| config))
    {
        Ok(config) => config,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    // A client disconnect drops this future, which stops the run's units.
    match state.engine.run(&config, &CancellationToken::new()).await {
        Ok(result) => json_response(
            StatusCode::OK,
            build_simulate_response(&state, &args, &config, result),
        ),
        Err(err) => error_response(status_for(&err), &err.to_string()),
    }
}

/// Yearly values one HTTP request may ask the engine to hold (80 MB of f64).
const MAX_HTTP_PATH_VALUES: u64 = 10_000_000;

fn within_http_budget(config: &SimulationConfig) -> Result<(), String> {
    let values = u64::from(config.simulation_count) * config.year_count() as u64;
    if values > MAX_HTTP_PATH_VALUES {
        return Err(format!(
            "simulationCount x (totalYears + 1) = {values} exceeds the per-request limit of {MAX_HTTP_PATH_VALUES}"
        ));
    }
    Ok(())
}

fn status_for(err: &SimulationError) -> StatusCode {
    match err {
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        SimulationError::UnitTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<SimulateArgs, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: SimulatePayload) -> Result<SimulateArgs, String> {
    let mut args = default_args_for_api();

    if let Some(v) = payload.initial_amount {
        args.initial_amount = v;
    }
    if let Some(v) = payload.monthly_contribution {
        args.monthly_contribution = v;
    }
    if let Some(v) = payload.accumulation_years {
        args.accumulation_years = v;
    }
    if let Some(v) = payload.total_years {
        args.total_years = v;
    }
    if let Some(v) = payload.simulation_count {
        args.simulation_count = v;
    }
    if payload.seed.is_some() {
        args.seed = payload.seed;
    }

    if let Some(v) = payload.profile {
        args.profile = v.parse().map_err(|e: SimulationError| e.to_string())?;
    }
    if payload.expected_return.is_some() {
        args.expected_return = payload.expected_return;
    }
    if payload.volatility.is_some() {
        args.volatility = payload.volatility;
    }
    if let Some(v) = payload.noise {
        args.noise = v.into();
    }

    if let Some(v) = payload.monthly_income_rate {
        args.monthly_income_rate = v;
    }
    if let Some(v) = payload.retirement_monthly_income {
        args.retirement_monthly_income = v;
    }
    if let Some(v) = payload.retirement_annual_return {
        args.retirement_annual_return = v;
    }
    if let Some(v) = payload.retirement_volatility {
        args.retirement_volatility = v.into();
    }
    if let Some(v) = payload.retirement_volatility_value {
        args.retirement_volatility_value = v;
    } else if args.retirement_volatility == CliRetirementVolatility::Fixed {
        return Err("retirementVolatilityValue is required when retirementVolatility is fixed".to_string());
    }

    if let Some(v) = payload.jump_diffusion {
        args.jump_diffusion = v;
    }
    if let Some(v) = payload.crisis_frequency {
        args.crisis_frequency = v;
    }
    if let Some(v) = payload.crisis_mean_impact {
        args.crisis_mean_impact = v;
    }
    if let Some(v) = payload.crisis_volatility {
        args.crisis_volatility = v;
    }

    if let Some(v) = payload.scenario_bands {
        args.bands = v.into();
    }
    if let Some(v) = payload.include_paths {
        args.include_paths = v;
    }
    if payload.target_wealth.is_some() {
        args.target_wealth = payload.target_wealth;
    }

    Ok(args)
}

fn default_args_for_api() -> SimulateArgs {
    SimulateArgs {
        initial_amount: 100_000.0,
        monthly_contribution: 1_000.0,
        accumulation_years: 25,
        total_years: 55,
        simulation_count: DEFAULT_SIMULATIONS,
        seed: None,
        profile: InvestorProfile::Moderate,
        expected_return: None,
        volatility: None,
        noise: CliNoise::Gaussian,
        monthly_income_rate: DEFAULT_MONTHLY_INCOME_RATE,
        retirement_monthly_income: 0.0,
        retirement_annual_return: DEFAULT_RETIREMENT_RETURN,
        retirement_volatility: CliRetirementVolatility::Scaled,
        retirement_volatility_value: DEFAULT_RETIREMENT_VOLATILITY_FACTOR,
        jump_diffusion: false,
        crisis_frequency: 0.1,
        crisis_mean_impact: -0.15,
        crisis_volatility: 0.1,
        bands: CliBands::Wide,
        include_paths: false,
        target_wealth: None,
    }
}
