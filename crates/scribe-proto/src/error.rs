//! Error types shared by every Scribe crate.

use std::io;

/// Errors raised while capturing, storing, or replaying a session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid escape sequence at offset {offset}: {reason}")]
    Escape { offset: usize, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out after {attempts} attempts waiting for {what}")]
    Timeout { what: String, attempts: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Writer '{writer}' failed after {attempts} attempts: {reason}")]
    WriterFailed {
        writer: String,
        attempts: u32,
        reason: String,
    },

    /// A record the reader expects has not reached the sink yet.
    #[error("Not yet visible: {0}")]
    NotVisible(String),

    #[error("{0} is not supported by this sink")]
    Unsupported(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result alias using the shared [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::NotConnected
            ),
            Error::NotVisible(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Io(io::Error::from(io::ErrorKind::WouldBlock)).is_transient());
        assert!(Error::NotVisible("record 3".into()).is_transient());
        assert!(!Error::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
    }

    #[test]
    fn test_timeout_and_not_found_are_distinct() {
        let timeout = Error::Timeout {
            what: "record 7".into(),
            attempts: 5,
        };
        assert!(timeout.to_string().contains("5 attempts"));
        assert!(!matches!(timeout, Error::NotFound(_)));
    }
}
