//! JSON Lines file sink.
//!
//! One record per line, appended and flushed as it is written so a player
//! following the file sees records as soon as they are stored.

use async_trait::async_trait;
use scribe_proto::{Error, Record, Result, SessionContext};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::writer::{RecordSource, RecordWriter, SessionFilter, Visibility};

/// Appends records to a file.
pub struct FileWriter {
    path: PathBuf,
    file: Option<File>,
}

impl FileWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordWriter for FileWriter {
    fn name(&self) -> &str {
        "file"
    }

    async fn open(&mut self, session: &SessionContext) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        debug!(path = %self.path.display(), rec = %session.rec, "Opened file writer");
        self.file = Some(file);
        Ok(())
    }

    async fn write(&mut self, record: &Record) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(Error::Io(std::io::Error::other("file writer is not open")));
        };
        let mut line = record.to_json()?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_data().await?;
            debug!(path = %self.path.display(), "Closed file writer");
        }
        Ok(())
    }
}

/// Reads records back from a file written by [`FileWriter`].
///
/// Reads are incremental: each call continues at the byte position where the
/// previous one stopped. Only newline-terminated lines are consumed, so a
/// record still being appended is picked up on a later call.
pub struct FileSource {
    path: PathBuf,
    position: u64,
    line_number: u64,
    locked_rec: Option<String>,
    malformed: u64,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            position: 0,
            line_number: 0,
            locked_rec: None,
            malformed: 0,
        }
    }

    /// Byte offset of the next unread line.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of lines skipped because they did not parse.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    fn reset(&mut self) {
        self.position = 0;
        self.line_number = 0;
        self.locked_rec = None;
    }

    async fn read_new(&mut self, filter: &SessionFilter) -> Result<Vec<Record>> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(self.path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(self.position)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let complete = buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        if complete < buf.len() {
            debug!(
                bytes = buf.len() - complete,
                "Deferring incomplete trailing line"
            );
        }

        let mut records = Vec::new();
        // Drop the final newline so every split item is one stored line
        let lines = buf[..complete].strip_suffix(b"\n").unwrap_or_default();
        for raw in lines.split(|b| *b == b'\n').filter(|_| complete > 0) {
            self.line_number += 1;
            let line = String::from_utf8_lossy(raw);
            if line.trim().is_empty() {
                continue;
            }
            let record = match Record::from_json(&line) {
                Ok(record) => record,
                Err(e) => {
                    self.malformed += 1;
                    warn!(
                        path = %self.path.display(),
                        line_number = self.line_number,
                        error = %e,
                        "Skipping malformed record"
                    );
                    continue;
                }
            };
            if !filter.accepts(&record) {
                continue;
            }
            if filter.rec.is_none() {
                let locked = self.locked_rec.get_or_insert_with(|| record.rec.clone());
                if *locked != record.rec {
                    continue;
                }
            }
            records.push(record);
        }

        self.position += complete as u64;
        Ok(records)
    }
}

#[async_trait]
impl RecordSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    fn visibility(&self) -> Visibility {
        Visibility::Immediate
    }

    async fn query(&mut self, filter: &SessionFilter) -> Result<Vec<Record>> {
        self.reset();
        self.read_new(filter).await
    }

    async fn poll(&mut self, filter: &SessionFilter) -> Result<Vec<Record>> {
        self.read_new(filter).await
    }
}
