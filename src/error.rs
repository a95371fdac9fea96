use thiserror::Error;

/// Failure taxonomy for the tracker.
///
/// `Transport` covers anything retryable (mailbox, store, or extraction
/// provider unreachable, rate-limited, timed out). `Validation` covers
/// classifier output that fails the expected schema; it is downgraded to
/// "not job related" at the adapter boundary and never crosses it.
/// `Config` is fatal at startup only.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl TrackerError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        TrackerError::Transport(err.to_string())
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, TrackerError::Transport(_))
    }
}
