use thiserror::Error;

/// Main error type for the Racer system
#[derive(Error, Debug)]
pub enum RacerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Duplicate run: {key}")]
    DuplicateRun { key: String },

    #[error("Insufficient data: {message}")]
    InsufficientData { message: String },

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Not implemented: {strategy} has no selection strategy")]
    NotImplemented { strategy: String },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Per-trial failures reported by a target executor.
///
/// These never abort the optimization loop: they are converted into run
/// statuses and fed into the aggregate-cost policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrialError {
    #[error("Target crashed: {message}")]
    Crashed { message: String },

    #[error("Target timed out after {runtime} seconds")]
    Timeout { runtime: f64 },

    #[error("Target capped at {cutoff} seconds")]
    Capped { cutoff: f64 },

    #[error("Target ran out of memory: {message}")]
    Memout { message: String },
}

/// Result type alias for Racer operations
pub type RacerResult<T> = Result<T, RacerError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::RacerError::Configuration(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::RacerError::Internal(format!($($arg)*))
    };
}

/// Macro for creating insufficient-data errors
#[macro_export]
macro_rules! insufficient_data {
    ($($arg:tt)*) => {
        $crate::RacerError::InsufficientData { message: format!($($arg)*) }
    };
}
