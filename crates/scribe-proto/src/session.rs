//! Identity of one recorded terminal session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable description of the session being recorded.
///
/// Created once per capture and passed explicitly to every component that
/// stamps records, so no component has to consult process-wide state such
/// as the host name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Opaque session identifier shared by all records of the session.
    pub rec: String,

    /// Host the session was recorded on.
    pub host: String,

    /// User whose terminal was recorded.
    pub user: String,

    /// Terminal type (`TERM`) of the recorded terminal.
    pub term: String,

    /// Wall-clock time the session started.
    pub started_at: DateTime<Utc>,
}

impl SessionContext {
    /// Creates a context with a fresh unique session identifier.
    pub fn new(host: impl Into<String>, user: impl Into<String>, term: impl Into<String>) -> Self {
        Self {
            rec: uuid::Uuid::new_v4().simple().to_string(),
            host: host.into(),
            user: user.into(),
            term: term.into(),
            started_at: Utc::now(),
        }
    }

    /// Overrides the generated session identifier.
    pub fn with_rec(mut self, rec: impl Into<String>) -> Self {
        self.rec = rec.into();
        self
    }
}
