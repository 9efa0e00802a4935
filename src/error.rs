use thiserror::Error;

/// Main error type for the bot runner
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem / OS errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors (unreadable YAML, invalid values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Referenced bot id has no record
    #[error("Bot not found: {0}")]
    NotFound(String),

    /// The OS could not start the bot process
    #[error("Failed to start bot '{bot_id}': {reason}")]
    SpawnFailure { bot_id: String, reason: String },

    /// Rejected request input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Store errors that are not plain SQLite errors
    #[error("Store error: {0}")]
    Store(String),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

impl From<serde_yaml::Error> for RunnerError {
    fn from(e: serde_yaml::Error) -> Self {
        RunnerError::Config(e.to_string())
    }
}

impl From<String> for RunnerError {
    fn from(s: String) -> Self {
        RunnerError::Other(s)
    }
}

impl From<&str> for RunnerError {
    fn from(s: &str) -> Self {
        RunnerError::Other(s.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, RunnerError>;
