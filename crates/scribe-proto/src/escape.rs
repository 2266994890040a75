//! Binary-safe text escaping for record payloads.
//!
//! Terminal output is mostly text but may contain arbitrary bytes. Payloads
//! are stored as text using a reversible notation:
//! - valid UTF-8 characters are copied as-is (NUL included),
//! - a backslash is written as `\\`,
//! - every byte that is not part of a valid UTF-8 character is written as
//!   `\xHH` with two lowercase hex digits.
//!
//! The smallest escapable piece of input is a [`Unit`]: either one complete
//! character or one invalid byte. Splitting payloads at unit boundaries keeps
//! every fragment independently decodable.

use crate::error::{Error, Result};

/// Longest escaped form of a single unit, in bytes.
pub const MAX_UNIT_LEN: usize = 4;

/// Classification of a single escapable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// A complete UTF-8 character other than backslash.
    Char,
    /// The backslash character.
    Backslash,
    /// A byte that does not start a valid UTF-8 character here.
    Invalid,
}

/// One complete character or one invalid byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unit<'a> {
    pub raw: &'a [u8],
    pub kind: UnitKind,
}

impl Unit<'_> {
    /// Length of this unit once escaped, in bytes.
    pub fn encoded_len(&self) -> usize {
        match self.kind {
            UnitKind::Char => self.raw.len(),
            UnitKind::Backslash => 2,
            UnitKind::Invalid => 4,
        }
    }

    /// Appends the escaped form of this unit to `out`.
    pub fn push_escaped(&self, out: &mut String) {
        match self.kind {
            UnitKind::Char => {
                // Units of kind Char are validated on construction
                if let Ok(s) = std::str::from_utf8(self.raw) {
                    out.push_str(s);
                }
            }
            UnitKind::Backslash => out.push_str("\\\\"),
            UnitKind::Invalid => {
                out.push_str("\\x");
                out.push(hex_digit(self.raw[0] >> 4));
                out.push(hex_digit(self.raw[0] & 0x0f));
            }
        }
    }
}

/// Iterator over the escapable units of a byte slice.
#[derive(Debug, Clone)]
pub struct Units<'a> {
    rest: &'a [u8],
}

impl<'a> Units<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { rest: bytes }
    }
}

impl<'a> Iterator for Units<'a> {
    type Item = Unit<'a>;

    fn next(&mut self) -> Option<Unit<'a>> {
        let first = *self.rest.first()?;
        let width = utf8_width(first);

        let unit = if width > 0
            && self.rest.len() >= width
            && std::str::from_utf8(&self.rest[..width]).is_ok()
        {
            let kind = if first == b'\\' {
                UnitKind::Backslash
            } else {
                UnitKind::Char
            };
            Unit {
                raw: &self.rest[..width],
                kind,
            }
        } else {
            Unit {
                raw: &self.rest[..1],
                kind: UnitKind::Invalid,
            }
        };

        self.rest = &self.rest[unit.raw.len()..];
        Some(unit)
    }
}

/// Escapes raw bytes into payload text.
pub fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for unit in Units::new(bytes) {
        unit.push_escaped(&mut out);
    }
    out
}

/// Returns the length `escape(bytes)` would have, without allocating.
pub fn escaped_len(bytes: &[u8]) -> usize {
    Units::new(bytes).map(|u| u.encoded_len()).sum()
}

/// Reverses [`escape`].
pub fn unescape(text: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    let mut chars = text.char_indices();

    while let Some((offset, c)) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }

        match chars.next() {
            Some((_, '\\')) => out.push(b'\\'),
            Some((_, 'x')) => {
                let hi = chars.next().and_then(|(_, h)| h.to_digit(16));
                let lo = chars.next().and_then(|(_, l)| l.to_digit(16));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push((hi * 16 + lo) as u8),
                    _ => {
                        return Err(Error::Escape {
                            offset,
                            reason: "expected two hex digits after \\x".to_string(),
                        });
                    }
                }
            }
            Some((_, other)) => {
                return Err(Error::Escape {
                    offset,
                    reason: format!("unknown escape \\{other}"),
                });
            }
            None => {
                return Err(Error::Escape {
                    offset,
                    reason: "dangling backslash".to_string(),
                });
            }
        }
    }

    Ok(out)
}

/// Number of trailing bytes that form the start of a UTF-8 character whose
/// remaining bytes have not arrived yet.
///
/// Capture reads split the byte stream at arbitrary points; these bytes are
/// held back until the next chunk instead of being escaped as invalid.
pub fn incomplete_suffix_len(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let b = bytes[i];
        if utf8_width(b) > 1 {
            return match std::str::from_utf8(&bytes[i..]) {
                Err(e) if e.error_len().is_none() => bytes.len() - i,
                _ => 0,
            };
        }
        if !is_continuation(b) {
            return 0;
        }
    }
    0
}

fn utf8_width(lead: u8) -> usize {
    match lead {
        0x00..=0x7f => 1,
        0xc2..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf4 => 4,
        _ => 0,
    }
}

fn is_continuation(b: u8) -> bool {
    (0x80..=0xbf).contains(&b)
}

fn hex_digit(nibble: u8) -> char {
    char::from_digit(u32::from(nibble), 16).unwrap_or('0')
}
