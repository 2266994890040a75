//! In-memory sink with failure and visibility-delay injection.
//!
//! ```
//! use scribe_core::testing::MemorySink;
//! use scribe_core::Visibility;
//!
//! let sink = MemorySink::new();
//! let writer = sink.writer();
//! let source = sink.source(Visibility::Eventual);
//! # drop((writer, source));
//! ```

use async_trait::async_trait;
use scribe_proto::{Error, Record, Result, SessionContext};
use std::collections::{HashMap, HashSet};
use std::io::{self, ErrorKind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::writer::{RecordSource, RecordWriter, SessionFilter, Visibility};

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<Record>,
    fail_open: Option<ErrorKind>,
    failing_writes: u32,
    fail_kind: Option<ErrorKind>,
    /// Record id to number of polls it stays invisible for.
    hidden: HashMap<u64, u32>,
    opened: bool,
    closed: bool,
}

/// Shared in-memory store; writers and sources created from the same sink
/// see the same records.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn writer(&self) -> MemoryWriter {
        MemoryWriter {
            state: Arc::clone(&self.state),
        }
    }

    pub fn source(&self, visibility: Visibility) -> MemorySource {
        MemorySource {
            state: Arc::clone(&self.state),
            visibility,
            delivered: HashSet::new(),
            locked_rec: None,
        }
    }

    /// Everything stored so far, visible or not.
    pub fn records(&self) -> Vec<Record> {
        self.lock().records.clone()
    }

    /// Stores a record as if another writer had written it.
    pub fn push(&self, record: Record) {
        self.lock().records.push(record);
    }

    /// Makes the next `count` writes fail with `kind`.
    pub fn fail_writes(&self, count: u32, kind: ErrorKind) {
        let mut state = self.lock();
        state.failing_writes = count;
        state.fail_kind = Some(kind);
    }

    /// Makes `open` fail with `kind`.
    pub fn fail_open(&self, kind: ErrorKind) {
        self.lock().fail_open = Some(kind);
    }

    /// Keeps record `id` out of the next `polls` reads.
    pub fn hide_for_polls(&self, id: u64, polls: u32) {
        self.lock().hidden.insert(id, polls);
    }

    pub fn is_opened(&self) -> bool {
        self.lock().opened
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Write side of a [`MemorySink`].
#[derive(Debug)]
pub struct MemoryWriter {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryWriter {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RecordWriter for MemoryWriter {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open(&mut self, _session: &SessionContext) -> Result<()> {
        let mut state = self.lock();
        if let Some(kind) = state.fail_open {
            return Err(Error::Io(io::Error::new(kind, "injected open failure")));
        }
        state.opened = true;
        Ok(())
    }

    async fn write(&mut self, record: &Record) -> Result<()> {
        let mut state = self.lock();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            let kind = state.fail_kind.unwrap_or(ErrorKind::Other);
            return Err(Error::Io(io::Error::new(kind, "injected write failure")));
        }
        state.records.push(record.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}

/// Read side of a [`MemorySink`].
#[derive(Debug)]
pub struct MemorySource {
    state: Arc<Mutex<MemoryState>>,
    visibility: Visibility,
    delivered: HashSet<(String, u64)>,
    locked_rec: Option<String>,
}

impl MemorySource {
    fn read(&mut self, filter: &SessionFilter) -> Vec<Record> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::new();
        for record in &state.records {
            let still_hidden = state.hidden.get(&record.id).is_some_and(|p| *p > 0);
            if still_hidden || !filter.accepts(record) {
                continue;
            }
            if filter.rec.is_none() {
                let locked = self.locked_rec.get_or_insert_with(|| record.rec.clone());
                if *locked != record.rec {
                    continue;
                }
            }
            if self.delivered.insert((record.rec.clone(), record.id)) {
                out.push(record.clone());
            }
        }
        for polls in state.hidden.values_mut() {
            *polls = polls.saturating_sub(1);
        }
        out
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    fn visibility(&self) -> Visibility {
        self.visibility
    }

    async fn query(&mut self, filter: &SessionFilter) -> Result<Vec<Record>> {
        self.delivered.clear();
        self.locked_rec = None;
        Ok(self.read(filter))
    }

    async fn poll(&mut self, filter: &SessionFilter) -> Result<Vec<Record>> {
        Ok(self.read(filter))
    }
}

/// Clonable `Write` target whose contents can be inspected while in use.
#[derive(Debug, Clone, Default)]
pub struct SharedOutput {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl io::Write for SharedOutput {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
