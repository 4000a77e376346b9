mod composer;
mod engine;
mod error;
mod integrator;
mod orchestrator;
mod profile;
mod projection;
mod random;
mod statistics;
mod types;

pub use engine::{SimulationEngine, run_simulation, run_simulation_blocking};
pub use error::SimulationError;
pub use orchestrator::{
    BatchAssignment, BatchWorker, DEFAULT_MAX_UNITS, DEFAULT_MIN_BATCH_SIZE,
    DEFAULT_SEQUENTIAL_THRESHOLD, DEFAULT_UNIT_TIMEOUT, DEFAULT_YIELD_INTERVAL, EngineSettings,
    PathBatchWorker, plan_batches,
};
pub use profile::{InvestorProfile, ProfileParameters};
pub use projection::{
    DeterministicProjector, ProjectionCache, project_deterministic, required_monthly_contribution,
    sustainable_monthly_income,
};
pub use types::{
    JumpDiffusion, NoiseKind, RetirementVolatility, ScenarioBands, Scenarios, SimulationConfig,
    SimulationResult, Statistics, Trajectory, DEFAULT_MONTHLY_INCOME_RATE,
    DEFAULT_RETIREMENT_RETURN, DEFAULT_RETIREMENT_VOLATILITY_FACTOR, DEFAULT_SIMULATIONS,
};
