//! # scribe-adapters
//!
//! Terminal-facing side of Scribe.
//!
//! The `capture` module runs a command in a pseudo-terminal and records its
//! input, output and window changes. The `pipeline` module holds the pure
//! part of that path (rate limiting, latency-window coalescing and frame
//! encoding) so it can be driven without a terminal.

mod capture;
mod pipeline;

pub use capture::{CaptureLoop, CaptureOptions, CaptureOutcome, Termination, local_session};
pub use pipeline::{CapturePipeline, CaptureStats, Ingest};
