use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SimulationError {
    #[error("invalid {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("unknown investor profile '{0}' (expected conservative, moderate or aggressive)")]
    UnknownProfile(String),

    #[error("simulation unit {unit} failed: {reason}")]
    UnitFailed { unit: usize, reason: String },

    #[error("simulation unit {unit} exceeded its {}s time limit", .timeout.as_secs_f64())]
    UnitTimeout { unit: usize, timeout: Duration },

    #[error("expected {expected} trajectories but collected {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("trajectory {path} has {actual} yearly values, expected {expected}")]
    ShapeMismatch {
        path: usize,
        expected: usize,
        actual: usize,
    },

    #[error("simulation cancelled")]
    Cancelled,

    #[error("non-finite value produced for year {year}")]
    NonFiniteOutput { year: usize },

    #[error("simulation runtime error: {0}")]
    Runtime(String),
}

impl SimulationError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }

    /// True for errors caused by the caller's input rather than by execution.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. } | Self::UnknownProfile(_))
    }
}
