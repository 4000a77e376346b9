use serde::Serialize;

use super::error::SimulationError;

/// One simulated wealth path: a year-end balance for every year `0..=total_years`.
pub type Trajectory = Vec<f64>;

pub const DEFAULT_MONTHLY_INCOME_RATE: f64 = 0.004;
pub const DEFAULT_RETIREMENT_RETURN: f64 = 0.04;
pub const DEFAULT_SIMULATIONS: u32 = 500;
pub const DEFAULT_RETIREMENT_VOLATILITY_FACTOR: f64 = 0.7;

pub const MAX_TOTAL_YEARS: u32 = 150;
pub const MAX_SIMULATIONS: u32 = 1_000_000;
pub const MAX_VOLATILITY: f64 = 2.0;
const MAX_AMOUNT: f64 = 1e15;
const MAX_CRISIS_FREQUENCY: f64 = 12.0;
const MAX_CRISIS_MEAN_IMPACT: f64 = 5.0;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum NoiseKind {
    #[default]
    Gaussian,
    /// Unit-variance Laplace draws: same spread as the Gaussian, fatter tails.
    Laplace,
}

/// How the decumulation phase derives its volatility.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RetirementVolatility {
    /// Accumulation volatility multiplied by a damping factor.
    Scaled(f64),
    /// 1% at or below a 4% retirement return, plus 2 points per point above it.
    ReturnLinked,
    Fixed(f64),
}

impl Default for RetirementVolatility {
    fn default() -> Self {
        Self::Scaled(DEFAULT_RETIREMENT_VOLATILITY_FACTOR)
    }
}

impl RetirementVolatility {
    pub fn resolve(self, accumulation_volatility: f64, retirement_return: f64) -> f64 {
        const BASE_VOLATILITY: f64 = 0.01;
        const BASE_RETURN: f64 = 0.04;

        match self {
            Self::Scaled(factor) => accumulation_volatility * factor,
            Self::ReturnLinked => {
                if retirement_return <= BASE_RETURN {
                    BASE_VOLATILITY
                } else {
                    BASE_VOLATILITY + (retirement_return - BASE_RETURN) * 2.0
                }
            }
            Self::Fixed(volatility) => volatility,
        }
    }
}

/// Which percentile rungs are surfaced as pessimistic / median / optimistic.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ScenarioBands {
    /// P5 / P50 / P95.
    #[default]
    Wide,
    /// P25 / P50 / P75.
    Interquartile,
}

impl ScenarioBands {
    pub fn select(self, statistics: &Statistics) -> Scenarios {
        let (pessimistic, optimistic) = match self {
            Self::Wide => (&statistics.percentile5, &statistics.percentile95),
            Self::Interquartile => (&statistics.percentile25, &statistics.percentile75),
        };
        Scenarios {
            pessimistic: pessimistic.clone(),
            median: statistics.percentile50.clone(),
            optimistic: optimistic.clone(),
        }
    }
}

/// Poisson-timed crisis jumps layered over the diffusion.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct JumpDiffusion {
    /// Expected crises per year (lambda).
    pub frequency: f64,
    /// Mean log-impact of one crisis; negative for crashes.
    pub mean_impact: f64,
    pub impact_volatility: f64,
}

impl Default for JumpDiffusion {
    fn default() -> Self {
        Self {
            frequency: 0.1,
            mean_impact: -0.15,
            impact_volatility: 0.1,
        }
    }
}

impl JumpDiffusion {
    /// Annualised drift contributed by jumps: `lambda * (exp(mu_J + sigma_J^2 / 2) - 1)`.
    pub fn expected_drift(&self) -> f64 {
        let v = self.impact_volatility;
        self.frequency * ((self.mean_impact + 0.5 * v * v).exp() - 1.0)
    }

    /// Post-retirement allocation sees half as many crises, each half as severe.
    pub fn for_retirement(self) -> Self {
        Self {
            frequency: self.frequency * 0.5,
            mean_impact: self.mean_impact * 0.5,
            impact_volatility: self.impact_volatility * 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub initial_amount: f64,
    pub monthly_contribution: f64,
    pub accumulation_years: u32,
    pub total_years: u32,
    pub expected_return: f64,
    pub volatility: f64,
    pub monthly_income_rate: f64,
    /// Fixed monthly withdrawal; zero derives it from the balance at retirement.
    pub retirement_monthly_income: f64,
    pub retirement_annual_return: f64,
    pub simulation_count: u32,
    pub jump: Option<JumpDiffusion>,
    pub noise: NoiseKind,
    pub retirement_volatility: RetirementVolatility,
    pub scenario_bands: ScenarioBands,
    pub include_paths: bool,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_amount: 0.0,
            monthly_contribution: 0.0,
            accumulation_years: 0,
            total_years: 0,
            expected_return: 0.0,
            volatility: 0.0,
            monthly_income_rate: DEFAULT_MONTHLY_INCOME_RATE,
            retirement_monthly_income: 0.0,
            retirement_annual_return: DEFAULT_RETIREMENT_RETURN,
            simulation_count: DEFAULT_SIMULATIONS,
            jump: None,
            noise: NoiseKind::Gaussian,
            retirement_volatility: RetirementVolatility::default(),
            scenario_bands: ScenarioBands::Wide,
            include_paths: false,
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn year_count(&self) -> usize {
        self.total_years as usize + 1
    }

    pub fn decumulation_years(&self) -> u32 {
        self.total_years.saturating_sub(self.accumulation_years)
    }

    pub fn decumulation_volatility(&self) -> f64 {
        self.retirement_volatility
            .resolve(self.volatility, self.retirement_annual_return)
    }

    pub fn validate(&self) -> Result<(), SimulationError> {
        non_negative_money("initial_amount", self.initial_amount)?;
        non_negative_money("monthly_contribution", self.monthly_contribution)?;
        non_negative_money("retirement_monthly_income", self.retirement_monthly_income)?;

        if self.total_years < self.accumulation_years {
            return Err(SimulationError::invalid(
                "total_years",
                format!(
                    "{} must be >= accumulation_years ({})",
                    self.total_years, self.accumulation_years
                ),
            ));
        }
        if self.total_years > MAX_TOTAL_YEARS {
            return Err(SimulationError::invalid(
                "total_years",
                format!("{} exceeds the {MAX_TOTAL_YEARS}-year horizon limit", self.total_years),
            ));
        }

        annual_rate("expected_return", self.expected_return)?;
        annual_rate("retirement_annual_return", self.retirement_annual_return)?;

        if !(0.0..=MAX_VOLATILITY).contains(&self.volatility) {
            return Err(SimulationError::invalid(
                "volatility",
                format!("must be between 0 and {MAX_VOLATILITY}"),
            ));
        }
        if !self.monthly_income_rate.is_finite() || self.monthly_income_rate < 0.0 {
            return Err(SimulationError::invalid(
                "monthly_income_rate",
                "must be a finite value >= 0",
            ));
        }

        match self.retirement_volatility {
            RetirementVolatility::Scaled(factor) if !factor.is_finite() || factor < 0.0 => {
                return Err(SimulationError::invalid(
                    "retirement_volatility",
                    "damping factor must be a finite value >= 0",
                ));
            }
            RetirementVolatility::Fixed(v) if !v.is_finite() || v < 0.0 => {
                return Err(SimulationError::invalid(
                    "retirement_volatility",
                    "must be a finite value >= 0",
                ));
            }
            _ => {}
        }
        if !(0.0..=MAX_VOLATILITY).contains(&self.decumulation_volatility()) {
            return Err(SimulationError::invalid(
                "retirement_volatility",
                format!("resolves outside 0..={MAX_VOLATILITY}"),
            ));
        }

        if self.simulation_count == 0 || self.simulation_count > MAX_SIMULATIONS {
            return Err(SimulationError::invalid(
                "simulation_count",
                format!("{} must be in 1..={MAX_SIMULATIONS}", self.simulation_count),
            ));
        }

        if let Some(jump) = &self.jump {
            if !jump.frequency.is_finite() || !(0.0..=MAX_CRISIS_FREQUENCY).contains(&jump.frequency)
            {
                return Err(SimulationError::invalid(
                    "crisis_frequency",
                    format!("must be in 0..={MAX_CRISIS_FREQUENCY} crises per year"),
                ));
            }
            if !jump.mean_impact.is_finite() || jump.mean_impact.abs() > MAX_CRISIS_MEAN_IMPACT {
                return Err(SimulationError::invalid(
                    "crisis_mean_impact",
                    format!("must be within +/-{MAX_CRISIS_MEAN_IMPACT}"),
                ));
            }
            if !jump.impact_volatility.is_finite() || jump.impact_volatility < 0.0 {
                return Err(SimulationError::invalid(
                    "crisis_volatility",
                    "must be a finite value >= 0",
                ));
            }
        }

        Ok(())
    }
}

fn non_negative_money(field: &'static str, value: f64) -> Result<(), SimulationError> {
    if !(0.0..=MAX_AMOUNT).contains(&value) {
        return Err(SimulationError::invalid(
            field,
            format!("must be between 0 and {MAX_AMOUNT}"),
        ));
    }
    Ok(())
}

fn annual_rate(field: &'static str, value: f64) -> Result<(), SimulationError> {
    if !value.is_finite() || !(-1.0..=1.0).contains(&value) {
        return Err(SimulationError::invalid(field, "must be between -1 and 1"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenarios {
    pub pessimistic: Vec<f64>,
    pub median: Vec<f64>,
    pub optimistic: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub percentile5: Vec<f64>,
    pub percentile25: Vec<f64>,
    pub percentile50: Vec<f64>,
    pub percentile75: Vec<f64>,
    pub percentile95: Vec<f64>,
    pub success_probability: f64,
    pub standard_deviation: Vec<f64>,
    pub average_return: f64,
    pub volatility_realized: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub scenarios: Scenarios,
    pub statistics: Statistics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_paths: Option<Vec<Trajectory>>,
    pub simulation_count: u32,
    pub seed: u64,
}
