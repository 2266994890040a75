//! Ordered, gap-aware reading of one session from a sink.
//!
//! Records are handed out strictly in id order, each exactly once. When a
//! sink only makes records visible eventually, a missing id is waited for
//! with bounded backoff before the reader gives up with [`Error::Timeout`].
//! Sinks with immediate visibility cannot produce the missing record later,
//! so the gap is logged and skipped.

use scribe_proto::{Error, Record, Result};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::retry::Backoff;
use crate::writer::{RecordSource, SessionFilter, Visibility};

pub struct RecordReader {
    source: Box<dyn RecordSource>,
    filter: SessionFilter,
    backoff: Backoff,
    /// Id of the last record handed out; 0 before the first.
    last_id: u64,
    pending: BTreeMap<u64, Record>,
    ended: bool,
}

impl RecordReader {
    pub fn new(source: Box<dyn RecordSource>, filter: SessionFilter, backoff: Backoff) -> Self {
        Self {
            source,
            filter,
            backoff,
            last_id: 0,
            pending: BTreeMap::new(),
            ended: false,
        }
    }

    pub fn last_id(&self) -> u64 {
        self.last_id
    }

    /// True once the end marker has been handed out.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn filter(&self) -> &SessionFilter {
        &self.filter
    }

    /// Loads the records visible now.
    ///
    /// Eventually-visible sinks are re-queried with backoff until something
    /// shows up. With `allow_empty` an empty session is accepted (follow mode
    /// may start before the first record is written); otherwise it is
    /// reported as [`Error::NotFound`].
    pub async fn open(&mut self, allow_empty: bool) -> Result<Vec<Record>> {
        let mut attempt = 0u32;
        let batch = loop {
            let batch = self.source.query(&self.filter).await?;
            if !batch.is_empty() || allow_empty {
                break batch;
            }
            if self.source.visibility() == Visibility::Immediate
                || attempt + 1 >= self.backoff.attempts
            {
                return Err(Error::NotFound(format!(
                    "no records for {} in {} sink",
                    self.filter,
                    self.source.name()
                )));
            }
            let delay = self.backoff.delay(attempt);
            attempt += 1;
            debug!(attempt, ?delay, "No records visible yet, retrying");
            tokio::time::sleep(delay).await;
        };

        self.stash(batch);
        if self.last_id == 0
            && let Some(first) = self.pending.keys().next().copied()
            && first > 1
        {
            warn!(first, "Session starts after id 1, earlier records are unavailable");
            self.last_id = first - 1;
        }
        self.settle().await
    }

    /// Fetches records that became visible since the previous call.
    pub async fn fetch_new(&mut self) -> Result<Vec<Record>> {
        let batch = self.source.poll(&self.filter).await?;
        self.stash(batch);
        self.settle().await
    }

    fn stash(&mut self, batch: Vec<Record>) {
        for record in batch {
            if record.id <= self.last_id || self.ended {
                debug!(id = record.id, "Ignoring already delivered record");
                continue;
            }
            self.pending.insert(record.id, record);
        }
    }

    fn drain_ready(&mut self) -> Vec<Record> {
        let mut ready = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.last_id + 1 {
                break;
            }
            let record = entry.remove();
            self.last_id = record.id;
            if record.is_end() {
                self.ended = true;
                self.pending.clear();
            }
            ready.push(record);
        }
        ready
    }

    /// Hands out everything that can be delivered in order, resolving gaps.
    async fn settle(&mut self) -> Result<Vec<Record>> {
        let mut ready = self.drain_ready();
        if self.pending.is_empty() {
            return Ok(ready);
        }

        match self.source.visibility() {
            Visibility::Immediate => {
                while let Some(next) = self.pending.keys().next().copied() {
                    warn!(
                        missing_from = self.last_id + 1,
                        missing_to = next - 1,
                        "Gap in record sequence, continuing"
                    );
                    self.last_id = next - 1;
                    ready.extend(self.drain_ready());
                }
            }
            Visibility::Eventual => {
                for attempt in 0..self.backoff.attempts {
                    let delay = self.backoff.delay(attempt);
                    debug!(
                        missing = self.last_id + 1,
                        attempt = attempt + 1,
                        ?delay,
                        "Waiting for record to become visible"
                    );
                    tokio::time::sleep(delay).await;
                    let batch = self.source.poll(&self.filter).await?;
                    self.stash(batch);
                    ready.extend(self.drain_ready());
                    if self.pending.is_empty() {
                        return Ok(ready);
                    }
                }
                return Err(Error::Timeout {
                    what: format!("record {} of {}", self.last_id + 1, self.filter),
                    attempts: self.backoff.attempts,
                });
            }
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySink;
    use scribe_proto::{Frame, SessionContext};
    use std::time::Duration;

    fn ctx() -> SessionContext {
        SessionContext::new("h", "u", "t").with_rec("r1")
    }

    fn output(id: u64) -> Record {
        Record::new(
            &ctx(),
            id,
            id * 100,
            Frame::Output {
                txt: format!("{id}"),
            },
        )
    }

    fn backoff() -> Backoff {
        Backoff::new(4, Duration::from_millis(50), Duration::from_millis(200))
    }

    fn ids(records: &[Record]) -> Vec<u64> {
        records.iter().map(|r| r.id).collect()
    }

    #[tokio::test]
    async fn test_sorts_and_dedups() {
        let sink = MemorySink::new();
        for id in [3, 1, 2, 2] {
            sink.push(output(id));
        }
        let mut reader = RecordReader::new(
            Box::new(sink.source(Visibility::Immediate)),
            SessionFilter::any(),
            backoff(),
        );
        assert_eq!(ids(&reader.open(false).await.unwrap()), vec![1, 2, 3]);
        assert_eq!(reader.last_id(), 3);
        assert!(reader.fetch_new().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_session_not_found() {
        let sink = MemorySink::new();
        let mut reader = RecordReader::new(
            Box::new(sink.source(Visibility::Immediate)),
            SessionFilter::session("nope"),
            backoff(),
        );
        let err = reader.open(false).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_empty_session_allowed_when_following() {
        let sink = MemorySink::new();
        let mut reader = RecordReader::new(
            Box::new(sink.source(Visibility::Immediate)),
            SessionFilter::any(),
            backoff(),
        );
        assert!(reader.open(true).await.unwrap().is_empty());

        sink.push(output(1));
        assert_eq!(ids(&reader.fetch_new().await.unwrap()), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventual_gap_filled_after_retry() {
        let sink = MemorySink::new();
        for id in 1..=4 {
            sink.push(output(id));
        }
        sink.hide_for_polls(2, 2);
        let mut reader = RecordReader::new(
            Box::new(sink.source(Visibility::Eventual)),
            SessionFilter::any(),
            backoff(),
        );
        assert_eq!(ids(&reader.open(false).await.unwrap()), vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventual_gap_times_out() {
        let sink = MemorySink::new();
        for id in 1..=3 {
            sink.push(output(id));
        }
        sink.hide_for_polls(2, 100);
        let mut reader = RecordReader::new(
            Box::new(sink.source(Visibility::Eventual)),
            SessionFilter::any(),
            backoff(),
        );
        let err = reader.open(false).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { attempts: 4, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventual_session_appears_late() {
        let sink = MemorySink::new();
        sink.push(output(1));
        sink.hide_for_polls(1, 2);
        let mut reader = RecordReader::new(
            Box::new(sink.source(Visibility::Eventual)),
            SessionFilter::any(),
            backoff(),
        );
        assert_eq!(ids(&reader.open(false).await.unwrap()), vec![1]);
    }

    #[tokio::test]
    async fn test_immediate_gap_skipped() {
        let sink = MemorySink::new();
        for id in [1, 2, 4, 5] {
            sink.push(output(id));
        }
        let mut reader = RecordReader::new(
            Box::new(sink.source(Visibility::Immediate)),
            SessionFilter::any(),
            backoff(),
        );
        assert_eq!(ids(&reader.open(false).await.unwrap()), vec![1, 2, 4, 5]);
    }

    #[tokio::test]
    async fn test_records_after_end_ignored() {
        let sink = MemorySink::new();
        sink.push(output(1));
        sink.push(Record::new(&ctx(), 2, 300, Frame::End));
        let mut reader = RecordReader::new(
            Box::new(sink.source(Visibility::Immediate)),
            SessionFilter::any(),
            backoff(),
        );
        reader.open(false).await.unwrap();
        assert!(reader.is_ended());

        sink.push(output(3));
        assert!(reader.fetch_new().await.unwrap().is_empty());
    }
}
