//! # scribe-core
//!
//! Core capture and playback machinery for Scribe.
//!
//! This crate provides:
//! - The frame encoder turning raw terminal bytes into size-bounded records
//! - Token-bucket rate limiting and latency-window coalescing
//! - The writer/source abstraction over file, journal and syslog sinks
//! - Ordered writer dispatch with retry and backoff
//! - The record store reader used for playback and follow mode
//! - The playback engine and its interactive controller
//! - Configuration loading and validation

mod coalesce;
mod config;
pub mod controller;
mod dispatch;
mod encoder;
mod limiter;
pub mod playback;
mod reader;
mod retry;
pub mod sink;
pub mod testing;
mod writer;

pub use coalesce::{Batch, Coalescer, Piece};
pub use config::{
    ConfigError, FileConfig, JournalConfig, LimitAction, LimitConfig, LogConfig, MIN_PAYLOAD,
    PlayerConfig, ReaderKind, RecorderConfig, SyslogConfig, WriterKind,
};
pub use controller::{ControlCommand, Controller, ControllerState, Effect};
pub use dispatch::{DispatchStats, Dispatcher};
pub use encoder::FrameEncoder;
pub use limiter::{RateLimiter, TokenBucket, Verdict};
pub use playback::{GotoPoint, PlaybackCursor, PlaybackEngine, PlaybackOptions, PlaybackSummary};
pub use reader::RecordReader;
pub use retry::Backoff;
pub use writer::{FieldMatch, RecordSource, RecordWriter, SessionFilter, Visibility};
