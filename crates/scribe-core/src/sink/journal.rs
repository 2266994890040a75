//! systemd journal sink.
//!
//! Writes use the journal's native datagram protocol; reads shell out to
//! `journalctl -o json`. The journal indexes entries asynchronously, so
//! records become readable some time after they are written.

use async_trait::async_trait;
use scribe_proto::{Error, Record, Result, SessionContext};
use std::path::PathBuf;
use tokio::net::UnixDatagram;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::writer::{RecordSource, RecordWriter, SessionFilter, Visibility};

/// Default path of the journal's native socket.
pub const JOURNAL_SOCKET: &str = "/run/systemd/journal/socket";

const IDENTIFIER: &str = "scribe";

/// Serializes fields in the native journal format.
///
/// Values without newlines are written as `KEY=value\n`; others use the
/// length-prefixed binary form.
pub fn encode_entry(fields: &[(&str, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in fields {
        out.extend_from_slice(key.as_bytes());
        if value.contains('\n') {
            out.push(b'\n');
            out.extend_from_slice(&(value.len() as u64).to_le_bytes());
            out.extend_from_slice(value.as_bytes());
        } else {
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
        }
        out.push(b'\n');
    }
    out
}

/// Sends records to the journal.
pub struct JournalWriter {
    socket_path: PathBuf,
    priority: u8,
    augment: bool,
    socket: Option<UnixDatagram>,
}

impl JournalWriter {
    pub fn new(priority: u8, augment: bool) -> Self {
        Self::with_socket(JOURNAL_SOCKET, priority, augment)
    }

    /// Targets a custom socket path.
    pub fn with_socket(path: impl Into<PathBuf>, priority: u8, augment: bool) -> Self {
        Self {
            socket_path: path.into(),
            priority,
            augment,
            socket: None,
        }
    }

    fn fields(&self, record: &Record, message: String) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("MESSAGE", message),
            ("PRIORITY", self.priority.to_string()),
            ("SYSLOG_IDENTIFIER", IDENTIFIER.to_string()),
        ];
        if self.augment {
            fields.push(("SCRIBE_REC", record.rec.clone()));
            fields.push(("SCRIBE_USER", record.user.clone()));
            fields.push(("SCRIBE_ID", record.id.to_string()));
        }
        fields
    }
}

#[async_trait]
impl RecordWriter for JournalWriter {
    fn name(&self) -> &str {
        "journal"
    }

    async fn open(&mut self, session: &SessionContext) -> Result<()> {
        let socket = UnixDatagram::unbound()?;
        debug!(
            socket = %self.socket_path.display(),
            rec = %session.rec,
            augment = self.augment,
            "Opened journal writer"
        );
        self.socket = Some(socket);
        Ok(())
    }

    async fn write(&mut self, record: &Record) -> Result<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(Error::Io(std::io::Error::other(
                "journal writer is not open",
            )));
        };
        let entry = encode_entry(&self.fields(record, record.to_json()?));
        socket.send_to(&entry, &self.socket_path).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.socket = None;
        Ok(())
    }
}

/// Reads records back with `journalctl`.
pub struct JournalSource {
    program: PathBuf,
    cursor: Option<String>,
    locked_rec: Option<String>,
}

impl JournalSource {
    pub fn new() -> Self {
        Self::with_program("journalctl")
    }

    /// Uses a different `journalctl` executable.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cursor: None,
            locked_rec: None,
        }
    }

    fn args(&self, filter: &SessionFilter) -> Vec<String> {
        let mut args = vec![
            "--output=json".to_string(),
            "--no-pager".to_string(),
            format!("SYSLOG_IDENTIFIER={IDENTIFIER}"),
        ];
        if let Some(rec) = &filter.rec {
            args.push(format!("SCRIBE_REC={rec}"));
        }
        args.extend(filter.matches.iter().map(ToString::to_string));
        if let Some(cursor) = &self.cursor {
            args.push(format!("--after-cursor={cursor}"));
        }
        args
    }

    async fn read(&mut self, filter: &SessionFilter) -> Result<Vec<Record>> {
        let args = self.args(filter);
        debug!(program = %self.program.display(), ?args, "Querying journal");
        let output = match Command::new(&self.program).args(&args).output().await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(self.program.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if !output.status.success() {
            return Err(Error::Io(std::io::Error::other(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }

        let (records, cursor) = parse_entries(&String::from_utf8_lossy(&output.stdout));
        if cursor.is_some() {
            self.cursor = cursor;
        }

        let mut accepted = Vec::with_capacity(records.len());
        for record in records {
            if !filter.accepts(&record) {
                continue;
            }
            if filter.rec.is_none() {
                let locked = self.locked_rec.get_or_insert_with(|| record.rec.clone());
                if *locked != record.rec {
                    continue;
                }
            }
            accepted.push(record);
        }
        Ok(accepted)
    }
}

impl Default for JournalSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses `journalctl -o json` output into records and the last cursor.
///
/// Entries whose `MESSAGE` is not a record are skipped with a warning.
pub fn parse_entries(output: &str) -> (Vec<Record>, Option<String>) {
    let mut records = Vec::new();
    let mut cursor = None;
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let entry: serde_json::Value = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unparseable journal entry");
                continue;
            }
        };
        if let Some(c) = entry.get("__CURSOR").and_then(|c| c.as_str()) {
            cursor = Some(c.to_string());
        }
        let Some(message) = entry.get("MESSAGE").and_then(|m| m.as_str()) else {
            warn!("Skipping journal entry without a text MESSAGE");
            continue;
        };
        match Record::from_json(message) {
            Ok(record) => records.push(record),
            Err(e) => warn!(error = %e, "Skipping malformed record in journal"),
        }
    }
    (records, cursor)
}

#[async_trait]
impl RecordSource for JournalSource {
    fn name(&self) -> &str {
        "journal"
    }

    fn visibility(&self) -> Visibility {
        Visibility::Eventual
    }

    async fn query(&mut self, filter: &SessionFilter) -> Result<Vec<Record>> {
        self.cursor = None;
        self.locked_rec = None;
        self.read(filter).await
    }

    async fn poll(&mut self, filter: &SessionFilter) -> Result<Vec<Record>> {
        self.read(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::FieldMatch;
    use scribe_proto::Frame;

    fn record(id: u64) -> Record {
        let ctx = SessionContext::new("host", "alice", "xterm").with_rec("r1");
        Record::new(&ctx, id, 0, Frame::Output { txt: "hi".into() })
    }

    #[test]
    fn test_encode_entry() {
        let entry = encode_entry(&[
            ("MESSAGE", "plain".to_string()),
            ("MULTI", "a\nb".to_string()),
        ]);
        let mut expected = b"MESSAGE=plain\nMULTI\n".to_vec();
        expected.extend_from_slice(&3u64.to_le_bytes());
        expected.extend_from_slice(b"a\nb\n");
        assert_eq!(entry, expected);
    }

    #[tokio::test]
    async fn test_writer_sends_augmented_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.sock");
        let server = UnixDatagram::bind(&path).unwrap();

        let mut writer = JournalWriter::with_socket(&path, 4, true);
        writer.open(&SessionContext::new("h", "u", "t")).await.unwrap();
        writer.write(&record(7)).await.unwrap();

        let mut buf = vec![0u8; 8192];
        let n = server.recv(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("PRIORITY=4\n"));
        assert!(text.contains("SYSLOG_IDENTIFIER=scribe\n"));
        assert!(text.contains("SCRIBE_REC=r1\n"));
        assert!(text.contains("SCRIBE_ID=7\n"));
        assert!(text.contains(r#"MESSAGE={"ver":"1.0""#));
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_without_augment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.sock");
        let server = UnixDatagram::bind(&path).unwrap();

        let mut writer = JournalWriter::with_socket(&path, 6, false);
        writer.open(&SessionContext::new("h", "u", "t")).await.unwrap();
        writer.write(&record(1)).await.unwrap();

        let mut buf = vec![0u8; 8192];
        let n = server.recv(&mut buf).await.unwrap();
        assert!(!String::from_utf8_lossy(&buf[..n]).contains("SCRIBE_REC"));
    }

    #[test]
    fn test_parse_entries() {
        let message = serde_json::to_string(&record(3).to_json().unwrap()).unwrap();
        let output = format!(
            "{{\"__CURSOR\":\"s=1\",\"MESSAGE\":{message}}}\n\
             {{\"__CURSOR\":\"s=2\",\"MESSAGE\":\"not a record\"}}\n\
             {{\"__CURSOR\":\"s=3\",\"MESSAGE\":[1,2,3]}}\n"
        );
        let (records, cursor) = parse_entries(&output);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 3);
        assert_eq!(cursor.as_deref(), Some("s=3"));
    }

    #[test]
    fn test_query_args() {
        let mut source = JournalSource::new();
        let filter = SessionFilter::session("r1").with_match(FieldMatch::new("_UID", "1000"));
        let args = source.args(&filter);
        assert!(args.contains(&"SCRIBE_REC=r1".to_string()));
        assert!(args.contains(&"_UID=1000".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--after-cursor")));

        source.cursor = Some("s=9".into());
        assert!(source.args(&filter).contains(&"--after-cursor=s=9".to_string()));
    }

    #[tokio::test]
    async fn test_missing_journalctl_is_not_found() {
        let mut source = JournalSource::with_program("/nonexistent/journalctl");
        let err = source.query(&SessionFilter::any()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
