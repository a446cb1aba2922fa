//! Error types for meshbar-client.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The service socket could not be reached, even after reconnecting once.
    #[error("cannot reach meshbar service at {socket}: {reason}")]
    Unreachable { socket: PathBuf, reason: String },

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// The daemon executed the call and reported a failure.
    #[error("{0}")]
    Remote(String),

    #[error("service installation failed: {0}")]
    Install(String),

    /// Still mismatched after one reinstall.
    #[error("service reports version {found}, expected {expected}")]
    VersionMismatch { expected: String, found: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ClientError {
    /// Whether the error means the service could not be talked to at all.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Unreachable { .. } | ClientError::Timeout { .. }
        )
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ClientError {
    ClientError::Io {
        path: path.into(),
        source,
    }
}
