pub mod event;
pub mod parse;
pub mod stats;

#[cfg(feature = "bpf")]
pub mod bpf;

use std::collections::VecDeque;

use thiserror::Error;

/// Errors reported by an [`EventSource`] read.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Nothing is available right now. The caller backs off and polls again.
    #[error("no event available")]
    Empty,

    /// The underlying reader failed. Treated as transient by the agent.
    #[error("reading event source: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw event source feeding the agent loop.
///
/// `read` must not block for long: it either returns one raw record
/// immediately or reports [`SourceError::Empty`].
pub trait EventSource: Send {
    /// Returns the next raw record, copied out of the underlying buffer.
    fn read(&mut self) -> Result<Vec<u8>, SourceError>;

    /// Releases kernel attachments. Called once at shutdown.
    fn close(&mut self);
}

/// In-memory source that replays queued records. Used by tests and by
/// anything that wants to drive the pipeline without a kernel.
#[derive(Debug, Default)]
pub struct ReplaySource {
    records: VecDeque<Vec<u8>>,
    closed: bool,
}

impl ReplaySource {
    pub fn new<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        Self {
            records: records.into_iter().collect(),
            closed: false,
        }
    }

    /// Queue another record behind the existing ones.
    pub fn push(&mut self, record: Vec<u8>) {
        self.records.push_back(record);
    }

    /// Number of records not yet read.
    pub fn remaining(&self) -> usize {
        self.records.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl EventSource for ReplaySource {
    fn read(&mut self) -> Result<Vec<u8>, SourceError> {
        self.records.pop_front().ok_or(SourceError::Empty)
    }

    fn close(&mut self) {
        self.closed = true;
        self.records.clear();
    }
}
