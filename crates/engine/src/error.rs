//! Error types for the evolution engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed run configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A ParameterSpec that cannot describe a valid dimension.
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Indicator error: {0}")]
    Indicator(String),

    /// A single genome's backtest failed. Never aborts a batch.
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Market data error: {0}")]
    Data(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
