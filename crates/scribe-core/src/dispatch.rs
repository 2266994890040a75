//! Ordered, non-blocking hand-off of records to the writer.
//!
//! The capture loop must never wait on the sink. Records are queued on an
//! unbounded channel and written by a background task that owns the writer,
//! in the order they were sent. Transient write failures are retried with
//! backoff; anything else is fatal and reported through a watch channel so
//! the capture loop can stop the session.

use scribe_proto::{Error, Record, Result, SessionContext};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::retry::Backoff;
use crate::writer::RecordWriter;

/// Counters reported when dispatch finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Records persisted.
    pub written: u64,
    /// Write attempts repeated after a transient failure.
    pub retries: u64,
}

/// Handle to the background writer task.
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Vec<Record>>,
    failed: watch::Receiver<bool>,
    writer_name: String,
    task: JoinHandle<Result<DispatchStats>>,
}

impl Dispatcher {
    /// Opens the writer and starts the background task.
    ///
    /// Fails without spawning anything if the sink cannot be opened.
    pub async fn start(
        mut writer: Box<dyn RecordWriter>,
        session: &SessionContext,
        backoff: Backoff,
    ) -> Result<Self> {
        writer.open(session).await?;
        let writer_name = writer.name().to_string();
        info!(writer = %writer_name, rec = %session.rec, "Record writer opened");

        let (tx, rx) = mpsc::unbounded_channel();
        let (failed_tx, failed) = watch::channel(false);
        let task = tokio::spawn(run(writer, rx, backoff, failed_tx));

        Ok(Self {
            tx,
            failed,
            writer_name,
            task,
        })
    }

    /// Queues records for writing. Never waits on the sink.
    pub fn send(&self, records: Vec<Record>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.tx.send(records).map_err(|_| Error::WriterFailed {
            writer: self.writer_name.clone(),
            attempts: 0,
            reason: "writer task has stopped".to_string(),
        })
    }

    /// Receiver that flips to `true` when the writer fails fatally.
    pub fn failed(&self) -> watch::Receiver<bool> {
        self.failed.clone()
    }

    pub fn has_failed(&self) -> bool {
        *self.failed.borrow()
    }

    /// Waits until every queued record is written and the writer is closed.
    pub async fn finish(self) -> Result<DispatchStats> {
        drop(self.tx);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::WriterFailed {
                writer: self.writer_name,
                attempts: 0,
                reason: format!("writer task aborted: {e}"),
            }),
        }
    }
}

async fn run(
    mut writer: Box<dyn RecordWriter>,
    mut rx: mpsc::UnboundedReceiver<Vec<Record>>,
    backoff: Backoff,
    failed_tx: watch::Sender<bool>,
) -> Result<DispatchStats> {
    let mut stats = DispatchStats::default();

    while let Some(batch) = rx.recv().await {
        for record in &batch {
            if let Err(e) = write_with_retry(writer.as_mut(), record, &backoff, &mut stats).await {
                error!(writer = writer.name(), id = record.id, error = %e, "Record writer failed");
                failed_tx.send_replace(true);
                if let Err(close_err) = writer.close().await {
                    warn!(error = %close_err, "Failed to close writer after failure");
                }
                return Err(e);
            }
        }
    }

    writer.close().await?;
    debug!(
        written = stats.written,
        retries = stats.retries,
        "Record writer closed"
    );
    Ok(stats)
}

async fn write_with_retry(
    writer: &mut dyn RecordWriter,
    record: &Record,
    backoff: &Backoff,
    stats: &mut DispatchStats,
) -> Result<()> {
    let mut attempt = 0u32;
    loop {
        match writer.write(record).await {
            Ok(()) => {
                stats.written += 1;
                return Ok(());
            }
            Err(e) if e.is_transient() && attempt + 1 < backoff.attempts => {
                let delay = backoff.delay(attempt);
                attempt += 1;
                stats.retries += 1;
                warn!(
                    writer = writer.name(),
                    id = record.id,
                    attempt,
                    max_attempts = backoff.attempts,
                    error = %e,
                    ?delay,
                    "Record write failed, retrying with backoff"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(Error::WriterFailed {
                    writer: writer.name().to_string(),
                    attempts: attempt + 1,
                    reason: e.to_string(),
                });
            }
        }
    }
}
