//! Latency-window coalescing of captured I/O.
//!
//! Small reads from the terminal are buffered per stream and released as one
//! [`Batch`] when the latency window elapses, when the buffer reaches the
//! payload cap, when bytes from the other stream arrive, or at session end.
//! Each piece of a batch keeps its own arrival offset so the encoder can
//! preserve timing that spans longer than the window.

use scribe_proto::Stream;
use std::time::Duration;

/// Bytes from one read, stamped with their offset from session start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub offset: Duration,
    pub bytes: Vec<u8>,
}

/// Coalesced bytes of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub stream: Stream,

    /// Offset of the first piece.
    pub started: Duration,

    pub pieces: Vec<Piece>,
}

impl Batch {
    fn new(stream: Stream, offset: Duration) -> Self {
        Self {
            stream,
            started: offset,
            pieces: Vec::new(),
        }
    }

    /// Total number of raw bytes.
    pub fn len(&self) -> usize {
        self.pieces.iter().map(|p| p.bytes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.iter().all(|p| p.bytes.is_empty())
    }

    /// Concatenated raw bytes.
    pub fn bytes(&self) -> Vec<u8> {
        self.pieces.iter().flat_map(|p| p.bytes.iter().copied()).collect()
    }
}

/// Buffers admitted bytes until they are due for encoding.
#[derive(Debug)]
pub struct Coalescer {
    latency: Duration,
    cap: usize,
    pending: Option<Batch>,
}

impl Coalescer {
    pub fn new(latency: Duration, cap: usize) -> Self {
        Self {
            latency,
            cap,
            pending: None,
        }
    }

    /// Adds bytes read at `offset` and returns the batches now due, oldest first.
    pub fn push(&mut self, stream: Stream, offset: Duration, bytes: &[u8]) -> Vec<Batch> {
        let mut due = Vec::new();
        if bytes.is_empty() {
            return due;
        }

        if let Some(pending) = &self.pending {
            let switched = pending.stream != stream;
            let expired = offset.saturating_sub(pending.started) >= self.latency;
            let overflow = pending.len() + bytes.len() >= self.cap;
            if switched || expired || overflow {
                due.extend(self.pending.take());
            }
        }

        let batch = self
            .pending
            .get_or_insert_with(|| Batch::new(stream, offset));
        batch.pieces.push(Piece {
            offset,
            bytes: bytes.to_vec(),
        });

        if batch.len() >= self.cap {
            due.extend(self.pending.take());
        }
        due
    }

    /// Offset at which the pending batch must be released.
    pub fn deadline(&self) -> Option<Duration> {
        self.pending.as_ref().map(|b| b.started + self.latency)
    }

    /// Releases the pending batch if its window has elapsed at `now`.
    pub fn poll_expired(&mut self, now: Duration) -> Option<Batch> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.pending.take(),
            _ => None,
        }
    }

    /// Releases whatever is pending.
    pub fn flush(&mut self) -> Option<Batch> {
        self.pending.take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_reads_within_window_coalesce() {
        let mut c = Coalescer::new(ms(100), 1024);
        assert!(c.push(Stream::Output, ms(0), b"ab").is_empty());
        assert!(c.push(Stream::Output, ms(40), b"cd").is_empty());
        assert_eq!(c.deadline(), Some(ms(100)));

        assert!(c.poll_expired(ms(99)).is_none());
        let batch = c.poll_expired(ms(100)).unwrap();
        assert_eq!(batch.bytes(), b"abcd");
        assert_eq!(batch.started, ms(0));
        assert_eq!(batch.pieces[1].offset, ms(40));
        assert!(!c.has_pending());
    }

    #[test]
    fn test_stream_switch_flushes() {
        let mut c = Coalescer::new(ms(100), 1024);
        c.push(Stream::Input, ms(0), b"ls\r");
        let due = c.push(Stream::Output, ms(5), b"ls\r\n");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].stream, Stream::Input);
        assert_eq!(c.flush().unwrap().stream, Stream::Output);
    }

    #[test]
    fn test_late_piece_starts_new_batch() {
        let mut c = Coalescer::new(ms(100), 1024);
        c.push(Stream::Output, ms(0), b"a");
        let due = c.push(Stream::Output, ms(150), b"b");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].bytes(), b"a");
        assert_eq!(c.deadline(), Some(ms(250)));
    }

    #[test]
    fn test_cap_flushes_before_overflow() {
        let mut c = Coalescer::new(ms(100), 8);
        c.push(Stream::Output, ms(0), b"12345");
        let due = c.push(Stream::Output, ms(1), b"678");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].bytes(), b"12345");

        let due = c.push(Stream::Output, ms(2), b"abcdefghij");
        assert_eq!(due.len(), 2);
        assert_eq!(due[1].bytes(), b"abcdefghij");
        assert!(!c.has_pending());
    }

    #[test]
    fn test_empty_push_ignored() {
        let mut c = Coalescer::new(ms(100), 8);
        assert!(c.push(Stream::Output, ms(0), b"").is_empty());
        assert!(!c.has_pending());
    }
}
