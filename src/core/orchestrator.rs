use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::composer::PhasePlan;
use super::error::SimulationError;
use super::types::{SimulationConfig, Trajectory};

pub const DEFAULT_MAX_UNITS: usize = 8;
pub const DEFAULT_MIN_BATCH_SIZE: usize = 50;
pub const DEFAULT_UNIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SEQUENTIAL_THRESHOLD: usize = 100;
pub const DEFAULT_YIELD_INTERVAL: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Upper bound on concurrent units.
    pub max_units: usize,
    /// Fewest paths worth handing to one unit.
    pub min_batch_size: usize,
    pub unit_timeout: Duration,
    /// Runs with fewer paths than this stay on the calling task.
    pub sequential_threshold: usize,
    /// Sequential mode yields back to the scheduler after this many paths.
    pub yield_interval: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_units: num_cpus::get().clamp(1, DEFAULT_MAX_UNITS),
            min_batch_size: DEFAULT_MIN_BATCH_SIZE,
            unit_timeout: DEFAULT_UNIT_TIMEOUT,
            sequential_threshold: DEFAULT_SEQUENTIAL_THRESHOLD,
            yield_interval: DEFAULT_YIELD_INTERVAL,
        }
    }
}

/// A contiguous slice of path indices handed to one unit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BatchAssignment {
    pub unit: usize,
    pub first_path: u64,
    pub size: usize,
}

impl BatchAssignment {
    pub fn path_indices(&self) -> std::ops::Range<u64> {
        self.first_path..self.first_path + self.size as u64
    }
}

/// Splits `simulation_count` into `ceil(count / units)`-sized batches; the last
/// batch takes whatever remains.
pub fn plan_batches(simulation_count: usize, settings: &EngineSettings) -> Vec<BatchAssignment> {
    if simulation_count == 0 {
        return Vec::new();
    }
    let min_batch = settings.min_batch_size.max(1);
    let units = (simulation_count / min_batch).clamp(1, settings.max_units.max(1));
    let batch_size = simulation_count.div_ceil(units);

    let mut batches = Vec::with_capacity(units);
    let mut remaining = simulation_count;
    let mut first_path = 0_u64;
    for unit in 0..units {
        let size = if unit + 1 == units {
            remaining
        } else {
            batch_size.min(remaining)
        };
        if size == 0 {
            break;
        }
        batches.push(BatchAssignment {
            unit,
            first_path,
            size,
        });
        first_path += size as u64;
        remaining -= size;
    }
    batches
}

/// Unit of work executed on a blocking thread: one batch in, its trajectories out.
pub trait BatchWorker: Send + Sync + 'static {
    fn run_batch(
        &self,
        config: &SimulationConfig,
        seed: u64,
        batch: BatchAssignment,
        cancel: &CancellationToken,
    ) -> Result<Vec<Trajectory>, SimulationError>;
}

/// Runs the phase composer once per path in the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathBatchWorker;

impl BatchWorker for PathBatchWorker {
    fn run_batch(
        &self,
        config: &SimulationConfig,
        seed: u64,
        batch: BatchAssignment,
        cancel: &CancellationToken,
    ) -> Result<Vec<Trajectory>, SimulationError> {
        let plan = PhasePlan::stochastic(config);
        let mut paths = Vec::with_capacity(batch.size);
        for path_index in batch.path_indices() {
            if cancel.is_cancelled() {
                return Err(SimulationError::Cancelled);
            }
            paths.push(plan.simulate_path(seed, path_index));
        }
        Ok(paths)
    }
}

/// Counts a unit as live for as long as the lease is held.
struct UnitLease(Arc<AtomicUsize>);

impl UnitLease {
    fn acquire(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for UnitLease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Orchestrator<W: BatchWorker = PathBatchWorker> {
    settings: EngineSettings,
    worker: Arc<W>,
    active_units: Arc<AtomicUsize>,
}

impl Orchestrator<PathBatchWorker> {
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_worker(settings, PathBatchWorker)
    }
}

impl<W: BatchWorker> Orchestrator<W> {
    pub fn with_worker(settings: EngineSettings, worker: W) -> Self {
        Self {
            settings,
            worker: Arc::new(worker),
            active_units: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Blocking units still executing, including ones abandoned after a timeout
    /// or cancellation that have not yet observed it.
    pub fn active_units(&self) -> usize {
        self.active_units.load(Ordering::SeqCst)
    }

    pub fn plan(&self, simulation_count: usize) -> Vec<BatchAssignment> {
        if simulation_count < self.settings.sequential_threshold {
            return vec![BatchAssignment {
                unit: 0,
                first_path: 0,
                size: simulation_count,
            }];
        }
        plan_batches(simulation_count, &self.settings)
    }

    /// Produces exactly `config.simulation_count` trajectories or fails.
    pub async fn run(
        &self,
        config: &SimulationConfig,
        seed: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Trajectory>, SimulationError> {
        let expected = config.simulation_count as usize;
        let batches = self.plan(expected);

        let paths = if batches.len() > 1 {
            self.run_parallel(config, seed, batches, cancel).await?
        } else {
            self.run_sequential(config, seed, cancel).await?
        };

        ensure_complete(config, &paths)?;
        Ok(paths)
    }

    /// Same work on the calling thread with no yielding.
    pub fn run_blocking(
        &self,
        config: &SimulationConfig,
        seed: u64,
    ) -> Result<Vec<Trajectory>, SimulationError> {
        let expected = config.simulation_count as usize;
        let batch = BatchAssignment {
            unit: 0,
            first_path: 0,
            size: expected,
        };
        let paths = self
            .worker
            .run_batch(config, seed, batch, &CancellationToken::new())?;
        ensure_complete(config, &paths)?;
        Ok(paths)
    }

    async fn run_sequential(
        &self,
        config: &SimulationConfig,
        seed: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Trajectory>, SimulationError> {
        let total = config.simulation_count as usize;
        let step = self.settings.yield_interval.max(1);
        let mut paths = Vec::with_capacity(total);

        let mut first_path = 0_usize;
        while first_path < total {
            if cancel.is_cancelled() {
                return Err(SimulationError::Cancelled);
            }
            let chunk = BatchAssignment {
                unit: 0,
                first_path: first_path as u64,
                size: step.min(total - first_path),
            };
            paths.extend(self.worker.run_batch(config, seed, chunk, cancel)?);
            first_path += chunk.size;
            tokio::task::yield_now().await;
        }

        Ok(paths)
    }

    async fn run_parallel(
        &self,
        config: &SimulationConfig,
        seed: u64,
        batches: Vec<BatchAssignment>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Trajectory>, SimulationError> {
        if cancel.is_cancelled() {
            return Err(SimulationError::Cancelled);
        }
        // Dropping the guard (any exit path, including this future being dropped)
        // tells every blocking unit to stop; dropping the JoinSet aborts the waiters.
        let scope = cancel.child_token();
        let _release = scope.clone().drop_guard();

        let shared = Arc::new(config.clone());
        let timeout = self.settings.unit_timeout;
        let unit_count = batches.len();
        let mut units = JoinSet::new();

        for batch in batches {
            let worker = Arc::clone(&self.worker);
            let config = Arc::clone(&shared);
            let token = scope.clone();
            let counter = Arc::clone(&self.active_units);
            debug!(unit = batch.unit, size = batch.size, "dispatching batch");

            units.spawn(async move {
                let blocking = tokio::task::spawn_blocking(move || {
                    let _lease = UnitLease::acquire(counter);
                    worker.run_batch(&config, seed, batch, &token)
                });
                let outcome = match tokio::time::timeout(timeout, blocking).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_err)) => Err(SimulationError::UnitFailed {
                        unit: batch.unit,
                        reason: join_err.to_string(),
                    }),
                    Err(_) => Err(SimulationError::UnitTimeout {
                        unit: batch.unit,
                        timeout,
                    }),
                };
                (batch.unit, outcome)
            });
        }

        let mut collected: Vec<(usize, Vec<Trajectory>)> = Vec::with_capacity(unit_count);
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(units = unit_count, "simulation cancelled");
                    return Err(SimulationError::Cancelled);
                }
                joined = units.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            let (unit, outcome) = joined.map_err(|e| SimulationError::Runtime(e.to_string()))?;
            match outcome {
                Ok(paths) => {
                    debug!(unit, paths = paths.len(), "batch merged");
                    collected.push((unit, paths));
                }
                Err(err) => {
                    warn!(unit, error = %err, "simulation unit failed, abandoning run");
                    return Err(err);
                }
            }
        }

        collected.sort_by_key(|(unit, _)| *unit);
        Ok(collected.into_iter().flat_map(|(_, paths)| paths).collect())
    }
}

/// Exactly `simulation_count` trajectories, each with one entry per year.
fn ensure_complete(config: &SimulationConfig, paths: &[Trajectory]) -> Result<(), SimulationError> {
    let expected = config.simulation_count as usize;
    if paths.len() != expected {
        return Err(SimulationError::CountMismatch {
            expected,
            actual: paths.len(),
        });
    }
    let year_count = config.year_count();
    if let Some((path, bad)) = paths
        .iter()
        .enumerate()
        .find(|(_, path)| path.len() != year_count)
    {
        return Err(SimulationError::ShapeMismatch {
            path,
            expected: year_count,
            actual: bad.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};
    use std::time::Instant;

    fn parallel_settings(max_units: usize) -> EngineSettings {
        EngineSettings {
            max_units,
            min_batch_size: 1,
            unit_timeout: Duration::from_secs(30),
            sequential_threshold: 0,
            yield_interval: 7,
        }
    }

    fn small_config(count: u32) -> SimulationConfig {
        SimulationConfig {
            initial_amount: 10_000.0,
            monthly_contribution: 100.0,
            accumulation_years: 5,
            total_years: 10,
            expected_return: 0.07,
            volatility: 0.15,
            retirement_monthly_income: 200.0,
            simulation_count: count,
            ..SimulationConfig::default()
        }
    }

    async fn wait_for_release<W: BatchWorker>(orchestrator: &Orchestrator<W>) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while orchestrator.active_units() > 0 {
            assert!(Instant::now() < deadline, "units were never released");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    struct FailingUnit(usize);

    impl BatchWorker for FailingUnit {
        fn run_batch(
            &self,
            config: &SimulationConfig,
            seed: u64,
            batch: BatchAssignment,
            cancel: &CancellationToken,
        ) -> Result<Vec<Trajectory>, SimulationError> {
            if batch.unit == self.0 {
                return Err(SimulationError::Runtime("disk on fire".to_string()));
            }
            PathBatchWorker.run_batch(config, seed, batch, cancel)
        }
    }

    struct PanickingUnit;

    impl BatchWorker for PanickingUnit {
        fn run_batch(
            &self,
            _config: &SimulationConfig,
            _seed: u64,
            batch: BatchAssignment,
            _cancel: &CancellationToken,
        ) -> Result<Vec<Trajectory>, SimulationError> {
            if batch.unit == 1 {
                panic!("worker crashed");
            }
            Ok(vec![vec![0.0]; batch.size])
        }
    }

    struct ShortUnit;

    impl BatchWorker for ShortUnit {
        fn run_batch(
            &self,
            config: &SimulationConfig,
            seed: u64,
            batch: BatchAssignment,
            cancel: &CancellationToken,
        ) -> Result<Vec<Trajectory>, SimulationError> {
            let mut paths = PathBatchWorker.run_batch(config, seed, batch, cancel)?;
            if batch.unit == 0 {
                paths.pop();
            }
            Ok(paths)
        }
    }

    /// Returns the right number of paths, each truncated to a single year.
    struct TruncatedPaths;

    impl BatchWorker for TruncatedPaths {
        fn run_batch(
            &self,
            _config: &SimulationConfig,
            _seed: u64,
            batch: BatchAssignment,
            _cancel: &CancellationToken,
        ) -> Result<Vec<Trajectory>, SimulationError> {
            Ok(vec![vec![1.0]; batch.size])
        }
    }

    /// Counts how many batches were started.
    struct CountingUnit(Arc<AtomicUsize>);

    impl BatchWorker for CountingUnit {
        fn run_batch(
            &self,
            config: &SimulationConfig,
            seed: u64,
            batch: BatchAssignment,
            cancel: &CancellationToken,
        ) -> Result<Vec<Trajectory>, SimulationError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            PathBatchWorker.run_batch(config, seed, batch, cancel)
        }
    }

    /// Spins until cancelled.
    struct StuckUnit;

    impl BatchWorker for StuckUnit {
        fn run_batch(
            &self,
            _config: &SimulationConfig,
            _seed: u64,
            _batch: BatchAssignment,
            cancel: &CancellationToken,
        ) -> Result<Vec<Trajectory>, SimulationError> {
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(SimulationError::Cancelled)
        }
    }

    #[test]
    fn batches_respect_minimum_size_and_unit_cap() {
        let settings = EngineSettings {
            max_units: 8,
            min_batch_size: 50,
            ..EngineSettings::default()
        };

        let batches = plan_batches(1001, &settings);
        assert_eq!(batches.len(), 8);
        assert_eq!(batches[0].size, 126);
        assert_eq!(batches[7].size, 1001 - 7 * 126);

        let batches = plan_batches(120, &settings);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].size, 60);
        assert_eq!(batches[1].first_path, 60);

        let batches = plan_batches(49, &settings);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].size, 49);

        assert!(plan_batches(0, &settings).is_empty());
    }

    #[test]
    fn small_runs_stay_sequential() {
        let orchestrator = Orchestrator::new(EngineSettings {
            max_units: 8,
            min_batch_size: 1,
            sequential_threshold: 100,
            ..EngineSettings::default()
        });
        assert_eq!(orchestrator.plan(99).len(), 1);
        assert_eq!(orchestrator.plan(100).len(), 8);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(128))]

        #[test]
        fn prop_batches_cover_every_path_exactly_once(
            count in 1usize..20_000,
            max_units in 1usize..16,
            min_batch in 0usize..200,
        ) {
            let settings = EngineSettings {
                max_units,
                min_batch_size: min_batch,
                ..EngineSettings::default()
            };
            let batches = plan_batches(count, &settings);
            prop_assert!(!batches.is_empty());
            prop_assert!(batches.len() <= max_units);
            let mut next = 0_u64;
            for (i, batch) in batches.iter().enumerate() {
                prop_assert_eq!(batch.unit, i);
                prop_assert_eq!(batch.first_path, next);
                prop_assert!(batch.size > 0);
                next += batch.size as u64;
            }
            prop_assert_eq!(next as usize, count);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn parallel_and_sequential_runs_agree_path_for_path() {
        let config = small_config(203);
        let parallel = Orchestrator::new(parallel_settings(4));
        let sequential = Orchestrator::new(EngineSettings {
            sequential_threshold: usize::MAX,
            ..parallel_settings(4)
        });
        let cancel = CancellationToken::new();

        let a = parallel.run(&config, 99, &cancel).await.expect("parallel run");
        let b = sequential.run(&config, 99, &cancel).await.expect("sequential run");
        let c = sequential.run_blocking(&config, 99).expect("blocking run");
        assert_eq!(a.len(), 203);
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(parallel.active_units(), 0);
    }

    #[tokio::test]
    async fn failing_unit_fails_the_whole_run() {
        let orchestrator = Orchestrator::with_worker(parallel_settings(4), FailingUnit(2));
        let err = orchestrator
            .run(&small_config(40), 1, &CancellationToken::new())
            .await
            .expect_err("must fail");
        assert_eq!(err, SimulationError::Runtime("disk on fire".to_string()));
        wait_for_release(&orchestrator).await;
    }

    #[tokio::test]
    async fn panicking_unit_is_reported_as_unit_failure() {
        let orchestrator = Orchestrator::with_worker(parallel_settings(3), PanickingUnit);
        let err = orchestrator
            .run(&small_config(30), 1, &CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(
            matches!(err, SimulationError::UnitFailed { unit: 1, .. }),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn short_batch_is_a_count_mismatch() {
        let orchestrator = Orchestrator::with_worker(parallel_settings(4), ShortUnit);
        let err = orchestrator
            .run(&small_config(40), 1, &CancellationToken::new())
            .await
            .expect_err("must fail");
        assert_eq!(
            err,
            SimulationError::CountMismatch {
                expected: 40,
                actual: 39
            }
        );
    }

    #[tokio::test]
    async fn truncated_paths_are_a_shape_mismatch() {
        let expected = SimulationError::ShapeMismatch {
            path: 0,
            expected: 11,
            actual: 1,
        };

        let orchestrator = Orchestrator::with_worker(parallel_settings(4), TruncatedPaths);
        let err = orchestrator
            .run(&small_config(40), 1, &CancellationToken::new())
            .await
            .expect_err("must fail");
        assert_eq!(err, expected);

        let err = orchestrator
            .run_blocking(&small_config(40), 1)
            .expect_err("must fail");
        assert_eq!(err, expected);
    }

    #[tokio::test]
    async fn pre_cancelled_parallel_run_starts_no_units() {
        let started = Arc::new(AtomicUsize::new(0));
        let orchestrator =
            Orchestrator::with_worker(parallel_settings(4), CountingUnit(Arc::clone(&started)));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(orchestrator.plan(40).len() > 1);

        let err = orchestrator
            .run(&small_config(40), 1, &cancel)
            .await
            .expect_err("must be cancelled");
        assert_eq!(err, SimulationError::Cancelled);
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.active_units(), 0);
    }

    #[tokio::test]
    async fn stuck_unit_times_out_and_is_released() {
        let settings = EngineSettings {
            unit_timeout: Duration::from_millis(50),
            ..parallel_settings(2)
        };
        let orchestrator = Orchestrator::with_worker(settings, StuckUnit);
        let err = orchestrator
            .run(&small_config(10), 1, &CancellationToken::new())
            .await
            .expect_err("must time out");
        assert!(matches!(err, SimulationError::UnitTimeout { .. }), "got {err:?}");
        wait_for_release(&orchestrator).await;
    }

    #[tokio::test]
    async fn cancellation_stops_units_and_returns_nothing() {
        let orchestrator = Orchestrator::with_worker(parallel_settings(4), StuckUnit);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = orchestrator
            .run(&small_config(40), 1, &cancel)
            .await
            .expect_err("must be cancelled");
        assert_eq!(err, SimulationError::Cancelled);
        wait_for_release(&orchestrator).await;
    }

    #[tokio::test]
    async fn dropping_the_run_future_releases_units() {
        let orchestrator = Orchestrator::with_worker(parallel_settings(4), StuckUnit);
        let cancel = CancellationToken::new();
        let outcome = tokio::time::timeout(
            Duration::from_millis(30),
            orchestrator.run(&small_config(40), 1, &cancel),
        )
        .await;
        assert!(outcome.is_err(), "stuck units cannot finish");
        wait_for_release(&orchestrator).await;
        assert!(!cancel.is_cancelled(), "caller token is left untouched");
    }

    #[tokio::test]
    async fn pre_cancelled_sequential_run_does_no_work() {
        let orchestrator = Orchestrator::new(EngineSettings {
            sequential_threshold: usize::MAX,
            ..parallel_settings(1)
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = orchestrator
            .run(&small_config(500), 1, &cancel)
            .await
            .expect_err("must be cancelled");
        assert_eq!(err, SimulationError::Cancelled);
    }
}
