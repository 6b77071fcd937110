//! Error types for the device statistics agent.

/// Top-level error type for the statistics scheduler.
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Checkpoint persistence error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Job scheduling error (platform queue, alarm, job records).
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Report payload is missing required fields.
    #[error("payload error: {0}")]
    Payload(String),

    /// HTTP client construction error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, StatsError>;
