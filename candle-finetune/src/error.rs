//! Error types for fitting, warm-starting and searching.

use thiserror::Error;

/// Result type for candle-finetune operations.
pub type Result<T> = std::result::Result<T, FinetuneError>;

/// Errors raised while building, fitting, scoring or searching estimators.
#[derive(Debug, Error)]
pub enum FinetuneError {
    /// A snapshot tensor does not have the shape of the module parameter it targets.
    #[error("shape mismatch for parameter `{name}`: module has {expected:?}, snapshot has {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A module parameter has no counterpart in the snapshot.
    #[error("parameter `{name}` is missing from the snapshot")]
    MissingParameter { name: String },

    /// Caller supplied features or labels of the wrong shape.
    #[error("invalid input shape: {0}")]
    InputShape(String),

    /// The loss became NaN or infinite.
    #[error("loss diverged to {value} at epoch {epoch}, batch {batch}")]
    NumericalDivergence {
        epoch: usize,
        batch: usize,
        value: f32,
    },

    #[error("estimator is not fitted, call `fit` first")]
    NotFitted,

    /// Every grid cell failed.
    #[error("no viable hyperparameter combination among {attempted}: {last_error}")]
    NoViableCombination { attempted: usize, last_error: String },

    #[error("unknown hyperparameter `{0}`")]
    UnknownHyperparameter(String),

    #[error("invalid value {value} for hyperparameter `{name}`: {reason}")]
    InvalidHyperparameter {
        name: String,
        value: f64,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("candle error: {0}")]
    Candle(#[from] candle::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl FinetuneError {
    pub fn input_shape(msg: impl Into<String>) -> Self {
        Self::InputShape(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn invalid_hyperparameter(
        name: impl Into<String>,
        value: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidHyperparameter {
            name: name.into(),
            value,
            reason: reason.into(),
        }
    }

    /// Whether the error only invalidates the single (combination, fold) fit that raised it.
    ///
    /// Grid search turns these into a failing score for the combination; every
    /// other error aborts the search.
    pub fn is_cell_local(&self) -> bool {
        matches!(self, Self::NumericalDivergence { .. })
    }
}
