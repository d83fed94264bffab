//! Error types for the sideline engine.

/// Top-level error type for the context replication and notification system.
#[derive(Debug, thiserror::Error)]
pub enum SidelineError {
    /// Configuration error (load, parse, invalid value).
    #[error("config error: {0}")]
    Config(String),

    /// Remote authority transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SidelineError>;
