use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use super::error::SimulationError;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestorProfile {
    Conservative,
    Moderate,
    Aggressive,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileParameters {
    pub profile: InvestorProfile,
    pub annual_return: f64,
    pub volatility: f64,
}

const PROFILE_TABLE: [ProfileParameters; 3] = [
    ProfileParameters {
        profile: InvestorProfile::Conservative,
        annual_return: 0.04,
        volatility: 0.01,
    },
    ProfileParameters {
        profile: InvestorProfile::Moderate,
        annual_return: 0.055,
        volatility: 0.055,
    },
    ProfileParameters {
        profile: InvestorProfile::Aggressive,
        annual_return: 0.065,
        volatility: 0.09,
    },
];

impl InvestorProfile {
    pub const ALL: [InvestorProfile; 3] = [Self::Conservative, Self::Moderate, Self::Aggressive];

    pub fn parameters(self) -> ProfileParameters {
        PROFILE_TABLE[self as usize]
    }

    pub fn annual_return(self) -> f64 {
        self.parameters().annual_return
    }

    pub fn volatility(self) -> f64 {
        self.parameters().volatility
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Moderate => "moderate",
            Self::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for InvestorProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for InvestorProfile {
    type Err = SimulationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conservative" | "conservador" => Ok(Self::Conservative),
            "moderate" | "moderado" => Ok(Self::Moderate),
            "aggressive" | "arrojado" => Ok(Self::Aggressive),
            _ => Err(SimulationError::UnknownProfile(s.to_string())),
        }
    }
}
