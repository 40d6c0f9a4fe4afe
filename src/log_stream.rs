//! Boundary between the replicated log and the state machine.
//!
//! The processing side only sees committed entries, in index order, and hands appends
//! back to the log when it leads the partition. Consensus sits behind these two traits;
//! [`LocalLog`] is the single-node implementation where "durably written" means
//! "committed".

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::entry::{IndexedEntry, RaftEntry};
use crate::error::StorageResult;
use crate::storage::log::{LogWriter, LogWriterOptions, SegmentStore, SegmentStoreOptions};
use crate::types::{LogIndex, RecordPosition};

#[async_trait]
pub trait CommitFeed: Send + Sync {
    /// Waits until the entry at `index` is committed and returns it.
    /// Returns `None` once the log has been closed.
    async fn next_committed(&self, index: LogIndex) -> StorageResult<Option<IndexedEntry>>;

    fn commit_index(&self) -> LogIndex;

    fn first_index(&self) -> LogIndex;
}

#[async_trait]
pub trait EntryAppender: Send + Sync {
    /// Resolves once the entry is durable; returns its log index.
    async fn append(&self, entry: RaftEntry) -> StorageResult<LogIndex>;

    /// Position the next application entry has to start at.
    fn next_record_position(&self) -> RecordPosition;
}

/// Single-node log: a segment store fed by a batching writer.
#[derive(Clone)]
pub struct LocalLog {
    writer: LogWriter,
}

impl LocalLog {
    pub fn new(writer: LogWriter) -> Self {
        Self { writer }
    }

    /// Opens the segment store and starts its writer task.
    pub fn open(store: SegmentStoreOptions, writer: LogWriterOptions) -> StorageResult<Self> {
        let store = Arc::new(SegmentStore::open(store)?);
        Ok(Self::new(LogWriter::start(store, writer)))
    }

    pub fn writer(&self) -> &LogWriter {
        &self.writer
    }

    pub fn store(&self) -> &Arc<SegmentStore> {
        self.writer.store()
    }

    pub async fn close(&self) -> StorageResult<()> {
        self.writer.close().await
    }
}

#[async_trait]
impl CommitFeed for LocalLog {
    async fn next_committed(&self, index: LogIndex) -> StorageResult<Option<IndexedEntry>> {
        let mut durable = self.writer.subscribe();
        if durable.wait_for(|durable| *durable >= index).await.is_err() {
            debug!("Log closed while waiting for index {}", index);
            return Ok(None);
        }
        self.writer.store().read(index).map(Some)
    }

    fn commit_index(&self) -> LogIndex {
        self.writer.durable_index()
    }

    fn first_index(&self) -> LogIndex {
        self.writer.store().first_index()
    }
}

#[async_trait]
impl EntryAppender for LocalLog {
    async fn append(&self, entry: RaftEntry) -> StorageResult<LogIndex> {
        self.writer.append(entry).await
    }

    fn next_record_position(&self) -> RecordPosition {
        self.writer.store().next_record_position()
    }
}
