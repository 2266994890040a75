//! syslog sink (write-only).

use async_trait::async_trait;
use chrono::{DateTime, Local};
use scribe_proto::{Error, Record, Result, SessionContext};
use std::path::PathBuf;
use tokio::net::UnixDatagram;
use tracing::debug;

/// Local syslog socket.
pub const SYSLOG_SOCKET: &str = "/dev/log";

/// Formats one RFC 3164 message for the local syslog daemon.
pub fn format_message(
    facility: u8,
    priority: u8,
    timestamp: DateTime<Local>,
    pid: u32,
    body: &str,
) -> String {
    let pri = u16::from(facility) * 8 + u16::from(priority);
    format!(
        "<{pri}>{} scribe[{pid}]: {body}",
        timestamp.format("%b %e %H:%M:%S")
    )
}

/// Sends records to syslog as JSON message bodies.
pub struct SyslogWriter {
    socket_path: PathBuf,
    facility: u8,
    priority: u8,
    pid: u32,
    socket: Option<UnixDatagram>,
}

impl SyslogWriter {
    pub fn new(facility: u8, priority: u8) -> Self {
        Self::with_socket(SYSLOG_SOCKET, facility, priority)
    }

    pub fn with_socket(path: impl Into<PathBuf>, facility: u8, priority: u8) -> Self {
        Self {
            socket_path: path.into(),
            facility,
            priority,
            pid: std::process::id(),
            socket: None,
        }
    }
}

#[async_trait]
impl crate::writer::RecordWriter for SyslogWriter {
    fn name(&self) -> &str {
        "syslog"
    }

    async fn open(&mut self, session: &SessionContext) -> Result<()> {
        self.socket = Some(UnixDatagram::unbound()?);
        debug!(
            socket = %self.socket_path.display(),
            facility = self.facility,
            priority = self.priority,
            rec = %session.rec,
            "Opened syslog writer"
        );
        Ok(())
    }

    async fn write(&mut self, record: &Record) -> Result<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(Error::Io(std::io::Error::other("syslog writer is not open")));
        };
        let message = format_message(
            self.facility,
            self.priority,
            Local::now(),
            self.pid,
            &record.to_json()?,
        );
        socket.send_to(message.as_bytes(), &self.socket_path).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.socket = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::RecordWriter;
    use chrono::TimeZone;
    use scribe_proto::Frame;

    #[test]
    fn test_format_message() {
        let ts = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        let msg = format_message(10, 6, ts, 42, "{}");
        assert_eq!(msg, "<86>Mar  7 09:05:01 scribe[42]: {}");
    }

    #[tokio::test]
    async fn test_writer_sends_datagram() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.sock");
        let server = UnixDatagram::bind(&path).unwrap();

        let session = SessionContext::new("h", "u", "t").with_rec("r1");
        let mut writer = SyslogWriter::with_socket(&path, 4, 5);
        writer.open(&session).await.unwrap();
        writer
            .write(&Record::new(&session, 1, 0, Frame::End))
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let n = server.recv(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("<37>"));
        assert!(text.contains(r#""stream":"end""#));
    }
}
