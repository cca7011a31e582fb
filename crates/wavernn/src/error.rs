//! Error kinds surfaced by the vocoder core.

use thiserror::Error;

use crate::weights::WeightError;

#[derive(Debug, Error)]
pub enum VocoderError {
    /// Declared hyperparameters disagree with the tensors or inputs provided.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("missing weight: {name}")]
    MissingWeight { name: String },
    /// NaN/Inf or an unusable probability distribution at decode step `step`.
    #[error("numeric instability at sample {step}: {detail}")]
    NumericInstability { step: usize, detail: String },
    #[error("generation cancelled after {samples_done} samples")]
    Cancelled { samples_done: usize },
    #[error(transparent)]
    Weights(WeightError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VocoderError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<WeightError> for VocoderError {
    fn from(err: WeightError) -> Self {
        match err {
            WeightError::Missing { name } => Self::MissingWeight { name },
            WeightError::ShapeMismatch {
                name,
                expected,
                actual,
            } => Self::Configuration(format!(
                "weight {name} has shape {actual:?}, expected {expected:?}"
            )),
            other => Self::Weights(other),
        }
    }
}

pub type Result<T, E = VocoderError> = std::result::Result<T, E>;

/// Shorthand for `ensure!`-style configuration checks.
macro_rules! ensure_config {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::VocoderError::Configuration(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_config;
