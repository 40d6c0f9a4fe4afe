use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::entry::{ENTRY_HEADER_SIZE, RaftEntry};
use crate::error::{StorageError, StorageResult};
use crate::types::LogIndex;

use super::store::SegmentStore;

/// Configuration of the batching log writer
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogWriterOptions {
    /// Maximum number of queued requests drained per write
    pub batch_size: usize,
    /// Appends are refused with `Backpressure` while this many bytes are unacknowledged
    pub max_pending_bytes: u64,
}

impl Default for LogWriterOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_pending_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LogWriteOp {
    Append(RaftEntry),
    TruncateSuffix {
        after: LogIndex,
        commit_index: LogIndex,
    },
    Compact(LogIndex),
    Close,
}

pub struct LogWriteRequest {
    pub op: LogWriteOp,
    /// Bytes accounted against `max_pending_bytes` until the request is answered
    pub bytes: u64,
    pub response_tx: oneshot::Sender<StorageResult<LogIndex>>,
}

/// Rough encoded size of an entry, used for backpressure accounting only.
fn estimated_size(entry: &RaftEntry) -> u64 {
    let body = match entry {
        RaftEntry::Initial(_) | RaftEntry::Initialize(_) => 16,
        RaftEntry::Configuration(e) => 16 + e.members.len() * 64,
        RaftEntry::OpenSession(e) => {
            64 + e.member_id.len() + e.service_name.len() + e.service_config.len()
        }
        RaftEntry::CloseSession(_) => 32,
        RaftEntry::KeepAlive(e) => 16 + e.session_ids.len() * 24,
        RaftEntry::Command(e) | RaftEntry::Query(e) => 32 + e.operation.len(),
        RaftEntry::Application(e) => 32 + e.data.len(),
    };
    (body + ENTRY_HEADER_SIZE) as u64
}

/// Handle to the writer task of one segment store.
///
/// Concurrent appends are drained in batches, written with a single sync, and each
/// caller is answered with the index its entry was stored at. The highest durable index
/// is published on a watch channel.
#[derive(Clone)]
pub struct LogWriter {
    options: LogWriterOptions,
    store: Arc<SegmentStore>,
    op_sender: mpsc::UnboundedSender<LogWriteRequest>,
    pending_bytes: Arc<AtomicU64>,
    durable_rx: watch::Receiver<LogIndex>,
}

impl LogWriter {
    /// Spawns the writer task. Must be called from within a tokio runtime.
    pub fn start(store: Arc<SegmentStore>, options: LogWriterOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (durable_tx, durable_rx) = watch::channel(store.last_index());
        let pending_bytes = Arc::new(AtomicU64::new(0));

        let task = WriterTask {
            store: store.clone(),
            batch_size: options.batch_size.max(1),
            pending_bytes: pending_bytes.clone(),
            durable_tx,
        };
        tokio::spawn(task.run(rx));

        Self {
            options,
            store,
            op_sender: tx,
            pending_bytes,
            durable_rx,
        }
    }

    pub fn store(&self) -> &Arc<SegmentStore> {
        &self.store
    }

    pub fn durable_index(&self) -> LogIndex {
        *self.durable_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LogIndex> {
        self.durable_rx.clone()
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes.load(Ordering::Acquire)
    }

    pub async fn append(&self, entry: RaftEntry) -> StorageResult<LogIndex> {
        let bytes = estimated_size(&entry);
        let limit = self.options.max_pending_bytes;
        let pending = self.pending_bytes.fetch_add(bytes, Ordering::AcqRel);
        // A single oversized entry still goes through when nothing else is queued.
        if pending > 0 && pending + bytes > limit {
            self.pending_bytes.fetch_sub(bytes, Ordering::AcqRel);
            debug!("Refusing append: {} bytes pending, limit {}", pending, limit);
            return Err(StorageError::Backpressure { pending, limit });
        }
        self.submit(LogWriteOp::Append(entry), bytes).await
    }

    pub async fn truncate_suffix(
        &self,
        after: LogIndex,
        commit_index: LogIndex,
    ) -> StorageResult<()> {
        self.submit(
            LogWriteOp::TruncateSuffix {
                after,
                commit_index,
            },
            0,
        )
        .await
        .map(|_| ())
    }

    pub async fn compact(&self, up_to: LogIndex) -> StorageResult<()> {
        self.submit(LogWriteOp::Compact(up_to), 0).await.map(|_| ())
    }

    /// Stops the writer task; waiters on the durable index observe the close.
    pub async fn close(&self) -> StorageResult<()> {
        self.submit(LogWriteOp::Close, 0).await.map(|_| ())
    }

    async fn submit(&self, op: LogWriteOp, bytes: u64) -> StorageResult<LogIndex> {
        let (response_tx, response_rx) = oneshot::channel();
        let request = LogWriteRequest {
            op,
            bytes,
            response_tx,
        };
        if self.op_sender.send(request).is_err() {
            self.pending_bytes.fetch_sub(bytes, Ordering::AcqRel);
            return Err(StorageError::Closed);
        }
        response_rx.await.map_err(|_| StorageError::Closed)?
    }
}

struct WriterTask {
    store: Arc<SegmentStore>,
    batch_size: usize,
    pending_bytes: Arc<AtomicU64>,
    durable_tx: watch::Sender<LogIndex>,
}

impl WriterTask {
    /// Operations are processed in order:
    /// - consecutive appends are written together and synced once
    /// - truncation and compaction are processed individually
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<LogWriteRequest>) {
        let mut closed = false;
        while !closed {
            let mut buf = Vec::with_capacity(self.batch_size);
            let size = receiver.recv_many(&mut buf, self.batch_size).await;
            if size == 0 {
                break;
            }

            let mut results: Vec<StorageResult<LogIndex>> = Vec::with_capacity(buf.len());
            let mut i = 0;
            while i < buf.len() {
                match &buf[i].op {
                    LogWriteOp::Append(_) => {
                        let start = i;
                        while i < buf.len() && matches!(&buf[i].op, LogWriteOp::Append(_)) {
                            i += 1;
                        }
                        let entries: Vec<RaftEntry> = buf[start..i]
                            .iter()
                            .filter_map(|req| match &req.op {
                                LogWriteOp::Append(entry) => Some(entry.clone()),
                                _ => None,
                            })
                            .collect();
                        results.extend(self.append_entries(&entries));
                    }
                    LogWriteOp::TruncateSuffix {
                        after,
                        commit_index,
                    } => {
                        let result = self
                            .store
                            .truncate_suffix(*after, *commit_index)
                            .map(|_| self.store.last_index());
                        results.push(result);
                        i += 1;
                    }
                    LogWriteOp::Compact(up_to) => {
                        let result = self.store.compact(*up_to).map(|_| *up_to);
                        results.push(result);
                        i += 1;
                    }
                    LogWriteOp::Close => {
                        closed = true;
                        results.push(Ok(self.store.last_index()));
                        i += 1;
                    }
                }
            }

            self.durable_tx.send_replace(self.store.last_index());

            for (req, result) in buf.into_iter().zip(results) {
                self.pending_bytes.fetch_sub(req.bytes, Ordering::AcqRel);
                let _ = req.response_tx.send(result);
            }
        }

        // Requests still queued behind a close are answered with `Closed` on drop.
        receiver.close();
        info!("Log writer stopped at index {}", self.store.last_index());
    }

    /// Writes a run of appends with one sync. When the run is refused as a whole, the
    /// entries are retried one by one so a single bad entry fails only its own caller.
    fn append_entries(&self, entries: &[RaftEntry]) -> Vec<StorageResult<LogIndex>> {
        let sync = self.store.options().sync_on_write;
        match self.store.append_batch(entries, sync) {
            Ok(last) => {
                let first = last + 1 - entries.len() as u64;
                (first..=last).map(Ok).collect()
            }
            Err(StorageError::NonMonotonic(reason)) if entries.len() > 1 => {
                warn!(
                    "Batch of {} appends refused ({}), retrying individually",
                    entries.len(),
                    reason,
                );
                entries
                    .iter()
                    .map(|entry| self.store.append_batch(std::slice::from_ref(entry), sync))
                    .collect()
            }
            Err(e) => {
                warn!("Failed to append {} entries: {}", entries.len(), e);
                entries.iter().map(|_| Err(e.clone())).collect()
            }
        }
    }
}
