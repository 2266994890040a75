//! Testing utilities: an in-memory sink and a shareable output buffer.

pub mod memory;

pub use memory::{MemorySink, MemorySource, MemoryWriter, SharedOutput};
