//! # scribe-proto
//!
//! Shared types, error definitions, and the payload codec for Scribe.
//!
//! This crate provides the foundational abstractions used across all Scribe
//! crates, including:
//! - `Record` and `Frame` types describing one captured I/O event
//! - `SessionContext` identifying the recorded session
//! - The binary-safe escape codec used for record payloads
//! - Common error types

mod error;
pub mod escape;
mod record;
mod session;

pub use error::{Error, Result};
pub use record::{FORMAT_VERSION, Frame, Record, Stream};
pub use session::SessionContext;
