use thiserror::Error;

/// Run-level failures. Any of these aborts the run before a summary exists.
#[derive(Debug, Error)]
pub enum ReconError {
    /// TOML parse / deserialization error.
    #[error("config parse error: {0}")]
    ConfigParse(String),
    /// Config validation error (threshold out of range, bad letter key, etc.).
    #[error("config validation error: {0}")]
    ConfigValidation(String),
    /// Malformed manual input. `index` is the zero-based entry position.
    #[error("entry {index}: {message}")]
    Validation { index: usize, message: String },
    /// Device discovery failed in automatic mode.
    #[error(transparent)]
    Feed(#[from] FeedError),
}

/// Failure reported by a [`crate::port::DeviceFeed`].
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("feed rejected credentials ({status})")]
    Auth { status: u16 },
    #[error("feed upstream error: {0}")]
    Upstream(String),
    #[error("feed payload error: {0}")]
    Payload(String),
}

/// Per-device storage failure. Always recovered by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("repository timed out: {0}")]
    Timeout(String),
    #[error("unknown vehicle '{0}'")]
    UnknownVehicle(String),
    #[error("storage error: {0}")]
    Storage(String),
}
