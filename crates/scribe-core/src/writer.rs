//! The sink abstraction.
//!
//! Every sink can be written through [`RecordWriter`]; sinks that can be read
//! back also implement [`RecordSource`]. The concrete sink is picked once at
//! construction from configuration (see [`crate::sink`]).

use async_trait::async_trait;
use scribe_proto::{Error, Record, Result, SessionContext};
use std::fmt;
use std::str::FromStr;

/// Write side of a sink.
///
/// Records arrive in sequence order and must be persisted in that order.
#[async_trait]
pub trait RecordWriter: Send {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Acquires the sink for a session.
    async fn open(&mut self, session: &SessionContext) -> Result<()>;

    /// Persists one record.
    ///
    /// Failures for which [`Error::is_transient`] holds may be retried.
    async fn write(&mut self, record: &Record) -> Result<()>;

    /// Flushes and releases the sink.
    async fn close(&mut self) -> Result<()>;
}

/// How soon a written record can be read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Readable as soon as the write returns.
    Immediate,
    /// Readable after some delay; readers must poll with backoff.
    Eventual,
}

/// Read side of a sink.
#[async_trait]
pub trait RecordSource: Send {
    fn name(&self) -> &str;

    fn visibility(&self) -> Visibility;

    /// Reads every matching record from the beginning of the sink.
    async fn query(&mut self, filter: &SessionFilter) -> Result<Vec<Record>>;

    /// Reads matching records added since the last `query` or `poll`.
    async fn poll(&mut self, filter: &SessionFilter) -> Result<Vec<Record>>;
}

/// A `FIELD=VALUE` match.
///
/// `REC`, `USER` and `HOST` (optionally prefixed with `SCRIBE_`) match the
/// corresponding record fields. Other names are sink-specific and only
/// evaluated by sinks that know them, such as journal fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMatch {
    pub field: String,
    pub value: String,
}

impl FieldMatch {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Evaluates the match against a record, `None` if the field is not a
    /// record field.
    pub fn matches(&self, record: &Record) -> Option<bool> {
        let name = self.field.to_ascii_uppercase();
        let name = name.strip_prefix("SCRIBE_").unwrap_or(&name);
        let actual = match name {
            "REC" => &record.rec,
            "USER" => &record.user,
            "HOST" | "_HOSTNAME" => &record.host,
            _ => return None,
        };
        Some(*actual == self.value)
    }
}

impl FromStr for FieldMatch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((field, value)) if !field.is_empty() => Ok(Self::new(field, value)),
            _ => Err(Error::InvalidConfig(format!(
                "match '{s}' must have the form FIELD=VALUE"
            ))),
        }
    }
}

impl fmt::Display for FieldMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.field, self.value)
    }
}

/// Selects the records of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    /// Session identifier; sources lock onto the first session seen if unset.
    pub rec: Option<String>,
    pub matches: Vec<FieldMatch>,
}

impl SessionFilter {
    /// Accepts any session.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn session(rec: impl Into<String>) -> Self {
        Self {
            rec: Some(rec.into()),
            matches: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_match(mut self, field_match: FieldMatch) -> Self {
        self.matches.push(field_match);
        self
    }

    /// Applies the session id and every record-field match.
    pub fn accepts(&self, record: &Record) -> bool {
        if self.rec.as_ref().is_some_and(|rec| record.rec != *rec) {
            return false;
        }
        self.matches
            .iter()
            .all(|m| m.matches(record).unwrap_or(true))
    }
}

impl fmt::Display for SessionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if let Some(rec) = &self.rec {
            parts.push(format!("rec={rec}"));
        }
        parts.extend(self.matches.iter().map(ToString::to_string));
        if parts.is_empty() {
            f.write_str("any session")
        } else {
            f.write_str(&parts.join(" "))
        }
    }
}
