use super::integrator::{MONTHS_PER_YEAR, MonthlyDynamics};
use super::random::{Rng, derive_path_seed};
use super::types::{SimulationConfig, Trajectory};

/// Everything needed to stitch an accumulation path onto a withdrawal path.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PhasePlan {
    initial_amount: f64,
    monthly_contribution: f64,
    accumulation_years: u32,
    total_years: u32,
    monthly_income_rate: f64,
    retirement_monthly_income: f64,
    accumulation: MonthlyDynamics,
    decumulation: MonthlyDynamics,
}

impl PhasePlan {
    pub(crate) fn stochastic(config: &SimulationConfig) -> Self {
        let accumulation = MonthlyDynamics::new(
            config.expected_return,
            config.volatility,
            config.noise,
            config.jump,
        );
        let decumulation = MonthlyDynamics::new(
            config.retirement_annual_return,
            config.decumulation_volatility(),
            config.noise,
            config.jump.map(|j| j.for_retirement()),
        );
        Self::with_dynamics(config, accumulation, decumulation)
    }

    /// Same cashflows, no randomness: the baseline projection.
    pub(crate) fn deterministic(config: &SimulationConfig) -> Self {
        Self::with_dynamics(
            config,
            MonthlyDynamics::deterministic(config.expected_return),
            MonthlyDynamics::deterministic(config.retirement_annual_return),
        )
    }

    fn with_dynamics(
        config: &SimulationConfig,
        accumulation: MonthlyDynamics,
        decumulation: MonthlyDynamics,
    ) -> Self {
        Self {
            initial_amount: config.initial_amount,
            monthly_contribution: config.monthly_contribution,
            accumulation_years: config.accumulation_years,
            total_years: config.total_years,
            monthly_income_rate: config.monthly_income_rate,
            retirement_monthly_income: config.retirement_monthly_income,
            accumulation,
            decumulation,
        }
    }

    pub(crate) fn is_deterministic(&self) -> bool {
        self.accumulation.is_deterministic() && self.decumulation.is_deterministic()
    }

    pub(crate) fn monthly_withdrawal(&self, retirement_balance: f64) -> f64 {
        if self.retirement_monthly_income > 0.0 {
            self.retirement_monthly_income
        } else {
            retirement_balance * self.monthly_income_rate
        }
    }

    /// Yearly snapshots `0..=total_years`; year 0 is the initial amount.
    pub(crate) fn compose(&self, rng: &mut Rng) -> Trajectory {
        let mut yearly = Vec::with_capacity(self.total_years as usize + 1);
        let mut balance = self.initial_amount;
        yearly.push(balance);

        for _ in 0..self.accumulation_years {
            for _ in 0..MONTHS_PER_YEAR {
                balance = self
                    .accumulation
                    .accumulate(balance, self.monthly_contribution, rng);
            }
            yearly.push(balance);
        }

        let withdrawal = self.monthly_withdrawal(balance);
        for _ in self.accumulation_years..self.total_years {
            for _ in 0..MONTHS_PER_YEAR {
                balance = self.decumulation.decumulate(balance, withdrawal, rng);
            }
            yearly.push(balance);
        }

        yearly
    }

    pub(crate) fn simulate_path(&self, base_seed: u64, path_index: u64) -> Trajectory {
        let mut rng = Rng::new(derive_path_seed(base_seed, path_index));
        self.compose(&mut rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{JumpDiffusion, NoiseKind};
    use proptest::prelude::{any, prop_assert, prop_assert_eq, proptest};

    fn sample_config() -> SimulationConfig {
        SimulationConfig {
            initial_amount: 50_000.0,
            monthly_contribution: 1_000.0,
            accumulation_years: 15,
            total_years: 40,
            expected_return: 0.08,
            volatility: 0.18,
            retirement_monthly_income: 3_000.0,
            simulation_count: 10,
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn trajectory_has_one_entry_per_year_plus_start() {
        let plan = PhasePlan::stochastic(&sample_config());
        let path = plan.simulate_path(1, 0);
        assert_eq!(path.len(), 41);
        assert_eq!(path[0], 50_000.0);
    }

    #[test]
    fn no_decumulation_segment_when_horizon_ends_at_retirement() {
        let mut config = sample_config();
        config.total_years = config.accumulation_years;
        let path = PhasePlan::stochastic(&config).simulate_path(9, 3);
        assert_eq!(path.len(), 16);
    }

    #[test]
    fn zero_accumulation_years_starts_withdrawing_immediately() {
        let mut config = sample_config();
        config.accumulation_years = 0;
        config.total_years = 3;
        config.volatility = 0.0;
        config.retirement_annual_return = 0.0;
        config.retirement_monthly_income = 1_000.0;
        config.initial_amount = 30_000.0;
        let path = PhasePlan::stochastic(&config).simulate_path(4, 0);
        assert_eq!(path.len(), 4);
        assert!((path[1] - 18_000.0).abs() < 1e-6);
        assert!((path[2] - 6_000.0).abs() < 1e-6);
        assert_eq!(path[3], 0.0);
    }

    #[test]
    fn rate_based_withdrawal_uses_balance_at_retirement() {
        let mut config = sample_config();
        config.retirement_monthly_income = 0.0;
        config.monthly_income_rate = 0.004;
        let plan = PhasePlan::deterministic(&config);
        assert!((plan.monthly_withdrawal(1_000_000.0) - 4_000.0).abs() < 1e-9);

        config.retirement_monthly_income = 2_500.0;
        let plan = PhasePlan::deterministic(&config);
        assert_eq!(plan.monthly_withdrawal(1_000_000.0), 2_500.0);
    }

    #[test]
    fn depleted_path_stays_at_zero() {
        let mut config = sample_config();
        config.retirement_monthly_income = 1_000_000.0;
        let path = PhasePlan::stochastic(&config).simulate_path(5, 5);
        let retired = &path[config.accumulation_years as usize + 1..];
        assert!(retired.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn same_seed_and_index_reproduce_the_path() {
        let mut config = sample_config();
        config.jump = Some(JumpDiffusion::default());
        config.noise = NoiseKind::Laplace;
        let plan = PhasePlan::stochastic(&config);
        assert_eq!(plan.simulate_path(77, 12), plan.simulate_path(77, 12));
        assert_ne!(plan.simulate_path(77, 12), plan.simulate_path(77, 13));
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(48))]

        #[test]
        fn prop_paths_are_finite_non_negative_and_sized(
            seed in any::<u64>(),
            path_index in 0u64..10_000,
            accumulation_years in 0u32..30,
            retirement_years in 0u32..30,
            initial in 0u32..2_000_000,
            contribution in 0u32..20_000,
            income in 0u32..40_000,
            mean_bp in -500i32..1500,
            vol_bp in 0u32..6000,
            with_jumps in any::<bool>(),
            laplace in any::<bool>(),
        ) {
            let config = SimulationConfig {
                initial_amount: initial as f64,
                monthly_contribution: contribution as f64,
                accumulation_years,
                total_years: accumulation_years + retirement_years,
                expected_return: mean_bp as f64 / 10_000.0,
                volatility: vol_bp as f64 / 10_000.0,
                retirement_monthly_income: income as f64,
                jump: with_jumps.then(JumpDiffusion::default),
                noise: if laplace { NoiseKind::Laplace } else { NoiseKind::Gaussian },
                ..SimulationConfig::default()
            };
            let path = PhasePlan::stochastic(&config).simulate_path(seed, path_index);
            prop_assert_eq!(path.len(), config.year_count());
            for value in &path {
                prop_assert!(value.is_finite() && *value >= 0.0, "bad value {}", value);
            }
        }
    }
}
