use std::collections::{HashMap, VecDeque};

use super::composer::PhasePlan;
use super::random::Rng;
use super::types::{SimulationConfig, Trajectory};

pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Noise-free counterpart of a simulated path: same cashflows, expected returns only.
pub fn project_deterministic(config: &SimulationConfig) -> Trajectory {
    let plan = PhasePlan::deterministic(config);
    // Never draws, so the generator is never advanced.
    debug_assert!(plan.is_deterministic());
    plan.compose(&mut Rng::new(0))
}

/// Level monthly payment that draws `wealth` down to zero over `years`.
pub fn sustainable_monthly_income(wealth: f64, annual_rate: f64, years: u32) -> f64 {
    if wealth <= 0.0 || years == 0 {
        return 0.0;
    }
    let months = years as f64 * 12.0;
    let monthly_rate = annual_rate / 12.0;
    if monthly_rate == 0.0 {
        return wealth / months;
    }
    wealth * monthly_rate / (1.0 - (1.0 + monthly_rate).powf(-months))
}

/// Level monthly contribution that grows `current` into `goal` after `years`.
pub fn required_monthly_contribution(current: f64, goal: f64, years: u32, annual_rate: f64) -> f64 {
    if years == 0 {
        return (goal - current).max(0.0);
    }
    let months = years as f64 * 12.0;
    let monthly_rate = annual_rate / 12.0;
    if monthly_rate == 0.0 {
        return ((goal - current) / months).max(0.0);
    }
    let growth = (1.0 + monthly_rate).powf(months);
    let shortfall = goal - current * growth;
    if shortfall <= 0.0 {
        return 0.0;
    }
    shortfall * monthly_rate / (growth - 1.0)
}

/// Everything a deterministic projection depends on, with floats keyed by bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ProjectionKey {
    initial_amount: u64,
    monthly_contribution: u64,
    accumulation_years: u32,
    total_years: u32,
    expected_return: u64,
    monthly_income_rate: u64,
    retirement_monthly_income: u64,
    retirement_annual_return: u64,
}

impl ProjectionKey {
    fn of(config: &SimulationConfig) -> Self {
        Self {
            initial_amount: config.initial_amount.to_bits(),
            monthly_contribution: config.monthly_contribution.to_bits(),
            accumulation_years: config.accumulation_years,
            total_years: config.total_years,
            expected_return: config.expected_return.to_bits(),
            monthly_income_rate: config.monthly_income_rate.to_bits(),
            retirement_monthly_income: config.retirement_monthly_income.to_bits(),
            retirement_annual_return: config.retirement_annual_return.to_bits(),
        }
    }
}

/// Bounded least-recently-used store of projections.
#[derive(Debug)]
pub struct ProjectionCache {
    capacity: usize,
    entries: HashMap<ProjectionKey, Trajectory>,
    // Front is least recently used.
    order: VecDeque<ProjectionKey>,
    hits: u64,
    misses: u64,
}

impl ProjectionCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            hits: 0,
            misses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    fn get(&mut self, key: &ProjectionKey) -> Option<Trajectory> {
        let found = self.entries.get(key).cloned();
        if found.is_some() {
            self.hits += 1;
            self.touch(key);
        } else {
            self.misses += 1;
        }
        found
    }

    fn insert(&mut self, key: ProjectionKey, value: Trajectory) {
        if self.entries.insert(key, value).is_some() {
            self.touch(&key);
            return;
        }
        self.order.push_back(key);
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn touch(&mut self, key: &ProjectionKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(*key);
    }
}

impl Default for ProjectionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

/// Memoizing front for [`project_deterministic`].
#[derive(Debug, Default)]
pub struct DeterministicProjector {
    cache: ProjectionCache,
}

impl DeterministicProjector {
    pub fn new(cache: ProjectionCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &ProjectionCache {
        &self.cache
    }

    pub fn project(&mut self, config: &SimulationConfig) -> Trajectory {
        let key = ProjectionKey::of(config);
        if let Some(hit) = self.cache.get(&key) {
            return hit;
        }
        let projection = project_deterministic(config);
        self.cache.insert(key, projection.clone());
        projection
    }
}
