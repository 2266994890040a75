//! Capture-side record pipeline: rate limiting, coalescing and encoding.
//!
//! The pipeline is independent of the PTY so it can be driven with
//! synthetic chunks. Chunks are limited one by one as they arrive and only
//! the admitted bytes enter the latency window; a coalesced buffer is never
//! discarded as a whole.

use scribe_core::{
    Batch, Coalescer, FrameEncoder, LimitAction, LogConfig, RateLimiter, RecorderConfig, Verdict,
};
use scribe_proto::{Record, Result, SessionContext, Stream};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// How far [`CapturePipeline::ingest`] got with a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Every byte was admitted or dropped by policy.
    Complete,
    /// A rate limit wait was cut short; the remaining bytes were discarded.
    Cancelled,
}

/// Counters kept while capturing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Bytes read from the terminal on logged streams.
    pub bytes_in: u64,
    /// Bytes discarded by the `drop` policy.
    pub dropped: u64,
    /// Time the read path spent waiting under the `delay` policy.
    pub delayed: Duration,
    /// Records produced, including window and end records.
    pub records: u64,
}

pub struct CapturePipeline {
    log: LogConfig,
    limiter: RateLimiter,
    coalescer: Coalescer,
    encoder: FrameEncoder,
    started: Instant,
    stats: CaptureStats,
}

impl CapturePipeline {
    /// Creates a pipeline for `session`, with offsets measured from `started`.
    pub fn new(config: &RecorderConfig, session: SessionContext, started: Instant) -> Self {
        Self {
            log: config.log,
            limiter: RateLimiter::new(&config.limit, started.into_std()),
            coalescer: Coalescer::new(config.latency(), config.payload),
            encoder: FrameEncoder::new(session, config.payload, config.latency()),
            started,
            stats: CaptureStats::default(),
        }
    }

    pub fn session(&self) -> &SessionContext {
        self.encoder.session()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    fn offset(&self, at: Instant) -> Duration {
        at.saturating_duration_since(self.started)
    }

    fn logs(&self, stream: Stream) -> bool {
        match stream {
            Stream::Input => self.log.input,
            Stream::Output => self.log.output,
            Stream::Window => self.log.window,
            Stream::End => true,
        }
    }

    /// Feeds bytes of `stream` read at `at`.
    ///
    /// Records that become due are handed to `emit` as soon as they exist,
    /// so under the `delay` policy everything admitted before a wait is
    /// already on its way to the writer while the read path sleeps. A wait
    /// ends early when `cancel` resolves; bytes not yet admitted are then
    /// counted as dropped.
    pub async fn ingest<F, C>(
        &mut self,
        stream: Stream,
        at: Instant,
        bytes: &[u8],
        emit: &mut F,
        cancel: C,
    ) -> Result<Ingest>
    where
        F: FnMut(Vec<Record>) -> Result<()>,
        C: Future<Output = ()>,
    {
        if bytes.is_empty() || !self.logs(stream) {
            return Ok(Ingest::Complete);
        }
        self.stats.bytes_in += bytes.len() as u64;
        tokio::pin!(cancel);

        let mut at = at;
        let mut rest = bytes;
        loop {
            emit(self.expire(at))?;
            match self.limiter.check(rest.len(), at.into_std()) {
                Verdict::Admit => {
                    emit(self.admit(stream, at, rest))?;
                    return Ok(Ingest::Complete);
                }
                Verdict::Drop { admitted, dropped } => {
                    emit(self.admit(stream, at, &rest[..admitted]))?;
                    self.stats.dropped += dropped as u64;
                    return Ok(Ingest::Complete);
                }
                Verdict::Wait { admitted, wait } => {
                    emit(self.admit(stream, at, &rest[..admitted]))?;
                    rest = &rest[admitted..];
                    let waiting_since = Instant::now();
                    let cancelled = tokio::select! {
                        () = tokio::time::sleep(wait) => false,
                        () = &mut cancel => true,
                    };
                    self.stats.delayed += waiting_since.elapsed();
                    if cancelled {
                        debug!(unadmitted = rest.len(), "Rate limit wait cancelled");
                        self.stats.dropped += rest.len() as u64;
                        return Ok(Ingest::Cancelled);
                    }
                    at = Instant::now();
                }
            }
        }
    }

    fn admit(&mut self, stream: Stream, at: Instant, bytes: &[u8]) -> Vec<Record> {
        if bytes.is_empty() {
            return Vec::new();
        }
        let offset = self.offset(at);
        let batches = self.coalescer.push(stream, offset, bytes);
        self.encode_all(batches)
    }

    fn encode_all(&mut self, batches: impl IntoIterator<Item = Batch>) -> Vec<Record> {
        let mut records = Vec::new();
        for batch in batches {
            trace!(stream = %batch.stream, len = batch.len(), "Encoding batch");
            records.extend(self.encoder.encode(&batch));
        }
        self.stats.records += records.len() as u64;
        records
    }

    /// Instant at which pending bytes must be released.
    pub fn deadline(&self) -> Option<Instant> {
        self.coalescer.deadline().map(|d| self.started + d)
    }

    /// Releases the pending batch if its latency window has elapsed at `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<Record> {
        let offset = self.offset(now);
        let batch = self.coalescer.poll_expired(offset);
        self.encode_all(batch)
    }

    /// Records a terminal size change. Pending bytes are released first so
    /// record order matches capture order. Never rate limited.
    pub fn window(&mut self, at: Instant, width: u16, height: u16) -> Vec<Record> {
        if !self.log.window {
            return Vec::new();
        }
        let pending = self.coalescer.flush();
        let mut records = self.encode_all(pending);
        records.push(self.encoder.window(self.offset(at), width, height));
        self.stats.records += 1;
        debug!(width, height, "Terminal size recorded");
        records
    }

    /// Releases everything pending and closes the session with an end record.
    pub fn finish(&mut self, at: Instant) -> Vec<Record> {
        let pending = self.coalescer.flush();
        let mut records = self.encode_all(pending);
        let tail = self.encoder.finish(self.offset(at));
        self.stats.records += tail.len() as u64;
        records.extend(tail);
        if self.limiter.action() != LimitAction::Pass {
            debug!(
                dropped = self.stats.dropped,
                delayed = ?self.stats.delayed,
                "Rate limiting summary"
            );
        }
        records
    }
}
