//! Structured error types shared with the transport layer

use std::path::PathBuf;
use thiserror::Error;

/// Outcome of a failed collector call.
///
/// The harvest state machine matches this exhaustively; each variant maps to
/// one recovery path.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Collector asked for the session to be torn down and re-registered.
    #[error("collector requested an agent restart")]
    ForceRestart,

    /// Collector asked the agent to stop reporting for the process lifetime.
    #[error("collector requested a permanent disconnect")]
    ForceDisconnect,

    /// Transient failure; the unsent data may be merged back and retried.
    #[error("retryable collector failure: {0}")]
    Retry(String),

    /// Request rejected in a way that resending would reproduce.
    #[error("collector discarded request: {0}")]
    Discard(String),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_error_display() {
        let err = SessionError::Retry("connection reset".to_string());
        assert_eq!(err.to_string(), "retryable collector failure: connection reset");
    }

    #[test]
    fn test_unexpected_wraps_anyhow() {
        let err: SessionError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, SessionError::Unexpected(_)));
        assert_eq!(err.to_string(), "boom");
    }
}
