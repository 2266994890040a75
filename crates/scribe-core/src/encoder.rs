//! Turns coalesced I/O into size-bounded, sequenced records.

use scribe_proto::escape::{self, Units};
use scribe_proto::{Frame, Record, SessionContext, Stream};
use std::time::Duration;
use tracing::trace;

use crate::coalesce::Batch;

/// Stateful encoder for one session.
///
/// Sequence ids start at 1 and increase by one for every record produced,
/// whatever its stream. Every input/output payload is shorter than the cap
/// once escaped, and fragments only split between whole characters, so each
/// record decodes on its own. An incomplete UTF-8 character at the end of a
/// batch is held back and prefixed to the next batch of the same stream.
#[derive(Debug)]
pub struct FrameEncoder {
    session: SessionContext,
    payload_cap: usize,
    latency: Duration,
    next_id: u64,
    input_carry: Vec<u8>,
    output_carry: Vec<u8>,
}

impl FrameEncoder {
    /// Creates an encoder. `payload_cap` must leave room for at least one
    /// escaped unit; configuration enforces a minimum well above that.
    pub fn new(session: SessionContext, payload_cap: usize, latency: Duration) -> Self {
        Self {
            session,
            payload_cap: payload_cap.max(escape::MAX_UNIT_LEN + 1),
            latency,
            next_id: 1,
            input_carry: Vec::new(),
            output_carry: Vec::new(),
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Id the next record will get.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Encodes an input or output batch into one or more records.
    pub fn encode(&mut self, batch: &Batch) -> Vec<Record> {
        let carry = std::mem::take(self.carry_mut(batch.stream));

        // Byte index in `data` where each piece starts, with its offset
        let mut starts = Vec::with_capacity(batch.pieces.len() + 1);
        let mut data = carry;
        if !data.is_empty() {
            starts.push((0, batch.started));
        }
        for piece in &batch.pieces {
            starts.push((data.len(), piece.offset));
            data.extend_from_slice(&piece.bytes);
        }

        let held = escape::incomplete_suffix_len(&data);
        let keep = data.len() - held;
        self.carry_mut(batch.stream)
            .extend_from_slice(&data[keep..]);
        data.truncate(keep);

        let offset_at = |index: usize| -> Duration {
            let arrived = starts
                .iter()
                .take_while(|(start, _)| *start <= index)
                .last()
                .map_or(batch.started, |(_, offset)| *offset);
            if arrived.saturating_sub(batch.started) >= self.latency {
                arrived
            } else {
                batch.started
            }
        };

        let mut fragments: Vec<(Duration, String)> = Vec::new();
        let mut current = String::new();
        let mut current_offset = batch.started;
        let mut index = 0;
        for unit in Units::new(&data) {
            if !current.is_empty() && current.len() + unit.encoded_len() >= self.payload_cap {
                fragments.push((current_offset, std::mem::take(&mut current)));
            }
            if current.is_empty() {
                current_offset = offset_at(index);
            }
            unit.push_escaped(&mut current);
            index += unit.raw.len();
        }
        if !current.is_empty() {
            fragments.push((current_offset, current));
        }

        let records: Vec<Record> = fragments
            .into_iter()
            .map(|(offset, txt)| {
                let frame = if batch.stream == Stream::Input {
                    Frame::Input { txt }
                } else {
                    Frame::Output { txt }
                };
                self.record(offset, frame)
            })
            .collect();

        trace!(
            stream = %batch.stream,
            bytes = keep,
            held,
            records = records.len(),
            "Encoded batch"
        );
        records
    }

    /// Creates a window-size record.
    pub fn window(&mut self, offset: Duration, width: u16, height: u16) -> Record {
        self.record(offset, Frame::Window { width, height })
    }

    /// Flushes held-back bytes as invalid bytes and emits the end marker.
    pub fn finish(&mut self, offset: Duration) -> Vec<Record> {
        let mut records = Vec::new();
        for stream in [Stream::Input, Stream::Output] {
            let carry = std::mem::take(self.carry_mut(stream));
            if carry.is_empty() {
                continue;
            }
            let txt = escape::escape(&carry);
            let frame = if stream == Stream::Input {
                Frame::Input { txt }
            } else {
                Frame::Output { txt }
            };
            records.push(self.record(offset, frame));
        }
        records.push(self.record(offset, Frame::End));
        records
    }

    fn record(&mut self, offset: Duration, frame: Frame) -> Record {
        let pos = u64::try_from(offset.as_millis()).unwrap_or(u64::MAX);
        let record = Record::new(&self.session, self.next_id, pos, frame);
        self.next_id += 1;
        record
    }

    fn carry_mut(&mut self, stream: Stream) -> &mut Vec<u8> {
        if stream == Stream::Input {
            &mut self.input_carry
        } else {
            &mut self.output_carry
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalesce::Piece;

    fn encoder(cap: usize) -> FrameEncoder {
        let session = SessionContext::new("host", "user", "xterm").with_rec("rec-1");
        FrameEncoder::new(session, cap, Duration::from_secs(10))
    }

    fn batch(stream: Stream, pieces: &[(u64, &[u8])]) -> Batch {
        Batch {
            stream,
            started: Duration::from_millis(pieces[0].0),
            pieces: pieces
                .iter()
                .map(|(ms, bytes)| Piece {
                    offset: Duration::from_millis(*ms),
                    bytes: bytes.to_vec(),
                })
                .collect(),
        }
    }

    fn decoded(records: &[Record]) -> Vec<u8> {
        records
            .iter()
            .flat_map(|r| r.decode_payload().unwrap())
            .collect()
    }

    #[test]
    fn test_small_batch_one_record() {
        let mut enc = encoder(2048);
        let records = enc.encode(&batch(Stream::Output, &[(5, b"Linux\r\n")]));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 1);
        assert_eq!(records[0].pos, 5);
        assert_eq!(records[0].frame.payload(), Some("Linux\r\n"));
        assert_eq!(enc.next_id(), 2);
    }

    #[test]
    fn test_large_output_split_under_cap() {
        let mut enc = encoder(32);
        let raw: Vec<u8> = (0..500u32).map(|i| b'a' + (i % 26) as u8).collect();
        let records = enc.encode(&batch(Stream::Output, &[(0, &raw)]));

        assert!(records.len() > 1);
        for record in &records {
            assert!(record.frame.payload().unwrap().len() < 32);
        }
        let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
        let expected: Vec<u64> = (1..=records.len() as u64).collect();
        assert_eq!(ids, expected);
        assert_eq!(decoded(&records), raw);
    }

    #[test]
    fn test_split_never_breaks_characters() {
        let mut enc = encoder(32);
        let text = "Watérmân найдена βρέθηκε ".repeat(20);
        let records = enc.encode(&batch(Stream::Output, &[(0, text.as_bytes())]));
        for record in &records {
            let txt = record.frame.payload().unwrap();
            assert!(txt.len() < 32);
            assert!(!txt.contains("\\x"));
        }
        assert_eq!(decoded(&records), text.as_bytes());
    }

    #[test]
    fn test_binary_output_escaped_within_cap() {
        let mut enc = encoder(32);
        let raw: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let records = enc.encode(&batch(Stream::Output, &[(0, &raw)]));
        for record in &records {
            assert!(record.frame.payload().unwrap().len() < 32);
        }
        let mut all = decoded(&records);
        all.extend(decoded(&enc.finish(Duration::from_millis(1))));
        assert_eq!(all, raw);
    }

    #[test]
    fn test_character_split_across_batches_is_carried() {
        let mut enc = encoder(2048);
        let euro = "€".as_bytes();
        let first = enc.encode(&batch(Stream::Output, &[(0, &[b'a', euro[0]])]));
        assert_eq!(first[0].frame.payload(), Some("a"));

        let second = enc.encode(&batch(Stream::Output, &[(20, &euro[1..])]));
        assert_eq!(second[0].frame.payload(), Some("€"));
        assert_eq!(second[0].pos, 20);
    }

    #[test]
    fn test_carry_is_per_stream() {
        let mut enc = encoder(2048);
        let word = "д".as_bytes();
        enc.encode(&batch(Stream::Output, &[(0, &word[..1])]));
        let input = enc.encode(&batch(Stream::Input, &[(1, b"q")]));
        assert_eq!(input[0].frame, Frame::Input { txt: "q".into() });

        let rest = enc.encode(&batch(Stream::Output, &[(2, &word[1..])]));
        assert_eq!(rest[0].frame.payload(), Some("д"));
    }

    #[test]
    fn test_late_piece_keeps_own_offset() {
        let session = SessionContext::new("h", "u", "t");
        let mut enc = FrameEncoder::new(session, 32, Duration::from_millis(100));
        let long = [b'x'; 40];
        let records = enc.encode(&batch(Stream::Output, &[(0, b"early"), (250, &long)]));
        assert_eq!(records[0].pos, 0);
        assert_eq!(records.last().unwrap().pos, 250);
    }

    #[test]
    fn test_finish_flushes_carry_then_end() {
        let mut enc = encoder(2048);
        enc.encode(&batch(Stream::Output, &[(0, &[0xe2, 0x82])]));
        let records = enc.finish(Duration::from_millis(900));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].frame.payload(), Some("\\xe2\\x82"));
        assert!(records[1].is_end());
        assert_eq!(records[1].pos, 900);
        assert_eq!(records[1].id, 2);
    }

    #[test]
    fn test_window_record_shares_sequence() {
        let mut enc = encoder(2048);
        enc.encode(&batch(Stream::Output, &[(0, b"x")]));
        let window = enc.window(Duration::from_millis(3), 100, 40);
        assert_eq!(window.id, 2);
        assert_eq!(window.frame, Frame::Window { width: 100, height: 40 });
    }
}
