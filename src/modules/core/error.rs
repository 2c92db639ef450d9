//! Error types for pgpolicy

use thiserror::Error;

/// Main error type for pgpolicy operations
#[derive(Error, Debug)]
pub enum PluginError {
    /// Malformed or unsupported configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The database could not be reached
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Connected, but the liveness check failed
    #[error("Ping failed: {0}")]
    Liveness(String),

    /// A query was attempted before a connection was established
    #[error("Not ready: {0}")]
    NotReady(String),

    /// The builtin was called with operands of the wrong shape
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A positional query argument could not be converted to a SQL value
    #[error("invalid argument at position {index}: {message}")]
    ArgumentConversion { index: usize, message: String },

    /// The database rejected the statement or failed while running it
    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    /// The evaluation deadline passed before the query finished
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The evaluation was cancelled while the query was running
    #[error("Query cancelled: {0}")]
    Cancelled(String),

    /// A result column could not be decoded
    #[error("Failed to read row: {0}")]
    RowConversion(String),

    /// A decoded row could not be represented as a policy value
    #[error("Failed to convert result: {0}")]
    ResultConversion(String),

    /// Lifecycle call not allowed in the current state
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PluginError {
    /// Shorthand for an argument conversion failure at `index`
    pub fn argument(index: usize, message: impl Into<String>) -> Self {
        PluginError::ArgumentConversion {
            index,
            message: message.into(),
        }
    }

    /// Returns true if this error should be logged at error level
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            PluginError::Connect(_)
                | PluginError::Liveness(_)
                | PluginError::Lifecycle(_)
                | PluginError::Internal(_)
        )
    }

    /// Returns true if this error affects the plugin status rather than a single query
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            PluginError::Config(_)
                | PluginError::Connect(_)
                | PluginError::Liveness(_)
                | PluginError::Lifecycle(_)
        )
    }

    /// The phase of a query or lifecycle call that produced this error
    pub fn phase(&self) -> &'static str {
        match self {
            PluginError::Config(_) | PluginError::Json(_) => "config",
            PluginError::Connect(_) | PluginError::NotReady(_) => "connect",
            PluginError::Liveness(_) => "ping",
            PluginError::InvalidInput(_) => "parse",
            PluginError::ArgumentConversion { .. } => "convert",
            PluginError::QueryExecution(_)
            | PluginError::DeadlineExceeded(_)
            | PluginError::Cancelled(_) => "query",
            PluginError::RowConversion(_) => "decode",
            PluginError::ResultConversion(_) => "assemble",
            PluginError::Lifecycle(_) | PluginError::Internal(_) => "lifecycle",
        }
    }
}

/// Result type alias using PluginError
pub type Result<T> = std::result::Result<T, PluginError>;
