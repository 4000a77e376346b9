use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::error::SimulationError;
use super::orchestrator::{BatchWorker, EngineSettings, Orchestrator, PathBatchWorker};
use super::statistics::{first_non_finite_year, summarize};
use super::types::{SimulationConfig, SimulationResult, Trajectory};

/// Validates a configuration, fans the paths out and reduces them into a result.
pub struct SimulationEngine<W: BatchWorker = PathBatchWorker> {
    orchestrator: Orchestrator<W>,
}

impl SimulationEngine<PathBatchWorker> {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            orchestrator: Orchestrator::new(settings),
        }
    }
}

impl Default for SimulationEngine<PathBatchWorker> {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

impl<W: BatchWorker> SimulationEngine<W> {
    pub fn with_worker(settings: EngineSettings, worker: W) -> Self {
        Self {
            orchestrator: Orchestrator::with_worker(settings, worker),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        self.orchestrator.settings()
    }

    pub fn active_units(&self) -> usize {
        self.orchestrator.active_units()
    }

    pub async fn run(
        &self,
        config: &SimulationConfig,
        cancel: &CancellationToken,
    ) -> Result<SimulationResult, SimulationError> {
        config.validate()?;
        let seed = resolve_seed(config);
        let started = Instant::now();
        info!(
            simulations = config.simulation_count,
            units = self.orchestrator.plan(config.simulation_count as usize).len(),
            seed,
            "starting monte carlo run"
        );

        let paths = self.orchestrator.run(config, seed, cancel).await?;
        let result = assemble(config, seed, paths)?;
        log_completion(config, &result, started);
        Ok(result)
    }

    /// Runs every path on the calling thread.
    pub fn run_blocking(&self, config: &SimulationConfig) -> Result<SimulationResult, SimulationError> {
        config.validate()?;
        let seed = resolve_seed(config);
        let started = Instant::now();
        info!(
            simulations = config.simulation_count,
            seed, "starting blocking monte carlo run"
        );

        let paths = self.orchestrator.run_blocking(config, seed)?;
        let result = assemble(config, seed, paths)?;
        log_completion(config, &result, started);
        Ok(result)
    }
}

pub async fn run_simulation(config: &SimulationConfig) -> Result<SimulationResult, SimulationError> {
    SimulationEngine::default()
        .run(config, &CancellationToken::new())
        .await
}

pub fn run_simulation_blocking(
    config: &SimulationConfig,
) -> Result<SimulationResult, SimulationError> {
    SimulationEngine::default().run_blocking(config)
}

fn resolve_seed(config: &SimulationConfig) -> u64 {
    config.seed.unwrap_or_else(rand::random)
}

fn assemble(
    config: &SimulationConfig,
    seed: u64,
    paths: Vec<Trajectory>,
) -> Result<SimulationResult, SimulationError> {
    let statistics = summarize(&paths, config.year_count());
    if let Some(year) = first_non_finite_year(&statistics) {
        return Err(SimulationError::NonFiniteOutput { year });
    }

    Ok(SimulationResult {
        scenarios: config.scenario_bands.select(&statistics),
        statistics,
        all_paths: config.include_paths.then_some(paths),
        simulation_count: config.simulation_count,
        seed,
    })
}

fn log_completion(config: &SimulationConfig, result: &SimulationResult, started: Instant) {
    let retirement = config.accumulation_years as usize;
    let stats = &result.statistics;
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        success_probability = stats.success_probability,
        p5_at_retirement = stats.percentile5.get(retirement).copied().unwrap_or(0.0),
        p50_at_retirement = stats.percentile50.get(retirement).copied().unwrap_or(0.0),
        p95_at_retirement = stats.percentile95.get(retirement).copied().unwrap_or(0.0),
        "monte carlo run complete"
    );
}
