use super::random::Rng;
use super::types::{JumpDiffusion, NoiseKind};

pub(crate) const MONTHS_PER_YEAR: u32 = 12;
pub(crate) const DT: f64 = 1.0 / MONTHS_PER_YEAR as f64;

#[derive(Debug, Clone, Copy)]
struct MonthlyJumps {
    lambda_dt: f64,
    mean_impact: f64,
    impact_volatility: f64,
}

/// Monthly multiplicative growth under GBM, optionally with crisis jumps.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MonthlyDynamics {
    drift: f64,
    diffusion: f64,
    noise: NoiseKind,
    jumps: Option<MonthlyJumps>,
}

impl MonthlyDynamics {
    pub(crate) fn new(
        annual_return: f64,
        volatility: f64,
        noise: NoiseKind,
        jump: Option<JumpDiffusion>,
    ) -> Self {
        let jump = jump.filter(|j| j.frequency > 0.0);
        // Compensate so the unconditional expected return stays at `annual_return`.
        let jump_drift = jump.map_or(0.0, |j| j.expected_drift());
        let mu = annual_return - jump_drift;

        Self {
            drift: (mu - 0.5 * volatility * volatility) * DT,
            diffusion: volatility * DT.sqrt(),
            noise,
            jumps: jump.map(|j| MonthlyJumps {
                lambda_dt: j.frequency * DT,
                mean_impact: j.mean_impact,
                impact_volatility: j.impact_volatility,
            }),
        }
    }

    pub(crate) fn deterministic(annual_return: f64) -> Self {
        Self::new(annual_return, 0.0, NoiseKind::Gaussian, None)
    }

    pub(crate) fn is_deterministic(&self) -> bool {
        self.diffusion == 0.0 && self.jumps.is_none()
    }

    /// One month's growth multiplier. Can be <= 0 only when several crises land together.
    pub(crate) fn growth_factor(&self, rng: &mut Rng) -> f64 {
        let shock = if self.diffusion > 0.0 {
            self.diffusion * rng.unit_noise(self.noise)
        } else {
            0.0
        };
        let mut factor = (self.drift + shock).exp();

        if let Some(jumps) = self.jumps {
            let count = rng.poisson_count(jumps.lambda_dt);
            if count > 0 {
                let mut impact = 0.0;
                for _ in 0..count {
                    let magnitude =
                        jumps.mean_impact + jumps.impact_volatility * rng.unit_noise(self.noise);
                    impact += magnitude.exp() - 1.0;
                }
                factor *= 1.0 + impact;
            }
        }

        factor
    }

    /// Contribution lands before growth.
    pub(crate) fn accumulate(&self, balance: f64, contribution: f64, rng: &mut Rng) -> f64 {
        ((balance + contribution) * self.growth_factor(rng)).max(0.0)
    }

    /// Withdrawal comes out before growth; an emptied balance stays at zero for the month.
    pub(crate) fn decumulate(&self, balance: f64, withdrawal: f64, rng: &mut Rng) -> f64 {
        let remaining = balance - withdrawal;
        if remaining <= 0.0 {
            return 0.0;
        }
        (remaining * self.growth_factor(rng)).max(0.0)
    }
}
