//! Error types for mvr
//!
//! Only setup paths return these. Per-cycle code logs and carries on.

/// Result type alias
pub type Result<T> = std::result::Result<T, MvrError>;

/// mvr error types
#[derive(Debug, thiserror::Error)]
pub enum MvrError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse or serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration that cannot be clamped into something usable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The session cycle thread failed
    #[error("Session error: {0}")]
    Session(String),
}
