//! The record schema shared by every writer and reader.
//!
//! A record is serialized as one flat JSON object. The `stream` field
//! selects which of the remaining fields are present:
//!
//! ```text
//! {"ver":"1.0","host":"h","rec":"r","user":"u","term":"xterm","id":1,"pos":0,"stream":"output","txt":"hello\r\n"}
//! {"ver":"1.0","host":"h","rec":"r","user":"u","term":"xterm","id":2,"pos":15,"stream":"window","width":80,"height":24}
//! {"ver":"1.0","host":"h","rec":"r","user":"u","term":"xterm","id":3,"pos":90,"stream":"end"}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::escape;
use crate::session::SessionContext;

/// Schema version written into every record.
pub const FORMAT_VERSION: &str = "1.0";

/// Stream tag of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    /// Bytes typed by the user.
    Input,
    /// Bytes written by the child process.
    Output,
    /// Terminal window dimension change.
    Window,
    /// Session-end marker.
    End,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stream::Input => "input",
            Stream::Output => "output",
            Stream::Window => "window",
            Stream::End => "end",
        };
        f.write_str(name)
    }
}

/// Stream-specific content of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stream", rename_all = "lowercase")]
pub enum Frame {
    /// Escaped input payload.
    Input { txt: String },
    /// Escaped output payload.
    Output { txt: String },
    /// New terminal dimensions.
    Window { width: u16, height: u16 },
    /// No further records follow.
    End,
}

impl Frame {
    /// Returns the stream tag of this frame.
    pub fn stream(&self) -> Stream {
        match self {
            Frame::Input { .. } => Stream::Input,
            Frame::Output { .. } => Stream::Output,
            Frame::Window { .. } => Stream::Window,
            Frame::End => Stream::End,
        }
    }

    /// Returns the escaped payload for input and output frames.
    pub fn payload(&self) -> Option<&str> {
        match self {
            Frame::Input { txt } | Frame::Output { txt } => Some(txt),
            Frame::Window { .. } | Frame::End => None,
        }
    }
}

/// One captured I/O event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Schema version.
    pub ver: String,

    /// Host the session was recorded on.
    pub host: String,

    /// Session identifier.
    pub rec: String,

    /// Recorded user.
    pub user: String,

    /// Terminal type.
    pub term: String,

    /// Sequence position within the session, starting at 1.
    pub id: u64,

    /// Milliseconds since session start.
    pub pos: u64,

    #[serde(flatten)]
    pub frame: Frame,
}

impl Record {
    /// Creates a record stamped with the session's identity.
    pub fn new(session: &SessionContext, id: u64, pos: u64, frame: Frame) -> Self {
        Self {
            ver: FORMAT_VERSION.to_string(),
            host: session.host.clone(),
            rec: session.rec.clone(),
            user: session.user.clone(),
            term: session.term.clone(),
            id,
            pos,
            frame,
        }
    }

    /// Returns the stream tag.
    pub fn stream(&self) -> Stream {
        self.frame.stream()
    }

    /// Returns true for the session-end marker.
    pub fn is_end(&self) -> bool {
        matches!(self.frame, Frame::End)
    }

    /// Decodes the payload back into raw bytes (empty for window and end records).
    pub fn decode_payload(&self) -> Result<Vec<u8>> {
        match self.frame.payload() {
            Some(txt) => escape::unescape(txt),
            None => Ok(Vec::new()),
        }
    }

    /// Serializes the record as a single JSON line without the trailing newline.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a record from one JSON line.
    pub fn from_json(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SessionContext {
        SessionContext::new("localhost", "user", "xterm").with_rec("rec-1")
    }

    #[test]
    fn test_output_record_is_flat() {
        let record = Record::new(
            &ctx(),
            1,
            0,
            Frame::Output {
                txt: escape::escape(b"Linux\r\n"),
            },
        );
        let json = record.to_json().unwrap();

        assert!(json.contains(r#""stream":"output""#));
        assert!(json.contains(r#""txt":"Linux\r\n""#));
        assert!(json.contains(r#""rec":"rec-1""#));
        assert!(!json.contains('\n'));

        let parsed = Record::from_json(&json).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.decode_payload().unwrap(), b"Linux\r\n");
    }

    #[test]
    fn test_window_and_end_records() {
        let window = Record::new(
            &ctx(),
            2,
            15,
            Frame::Window {
                width: 120,
                height: 30,
            },
        );
        let json = window.to_json().unwrap();
        assert!(json.contains(r#""stream":"window""#));
        assert!(json.contains(r#""width":120"#));
        assert_eq!(Record::from_json(&json).unwrap().stream(), Stream::Window);

        let end = Record::new(&ctx(), 3, 90, Frame::End);
        let parsed = Record::from_json(&end.to_json().unwrap()).unwrap();
        assert!(parsed.is_end());
        assert!(parsed.decode_payload().unwrap().is_empty());
    }

    #[test]
    fn test_binary_payload_in_json() {
        let record = Record::new(
            &ctx(),
            1,
            0,
            Frame::Output {
                txt: escape::escape(&[0x00, 0xff, b'\\']),
            },
        );
        let json = record.to_json().unwrap();
        assert!(json.contains("\\u0000"));
        assert!(json.contains("\\\\xff"));

        let parsed = Record::from_json(&json).unwrap();
        assert_eq!(parsed.decode_payload().unwrap(), vec![0x00, 0xff, b'\\']);
    }

    #[test]
    fn test_unknown_stream_rejected() {
        let line = r#"{"ver":"1.0","host":"h","rec":"r","user":"u","term":"t","id":1,"pos":0,"stream":"bogus"}"#;
        assert!(Record::from_json(line).is_err());
    }

    #[test]
    fn test_stream_display() {
        assert_eq!(Stream::Window.to_string(), "window");
        assert_eq!(Frame::End.stream(), Stream::End);
    }
}
