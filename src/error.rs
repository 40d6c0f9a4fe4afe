use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::types::{LogIndex, PartitionId, RecordPosition};

/// Top level error returned by partition operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Partition {0} is unavailable")]
    Unavailable(PartitionId),

    #[error("Partition {0} not found")]
    PartitionNotFound(PartitionId),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Wire format errors raised while encoding or decoding log entries and records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Buffer truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown entry kind {0}")]
    UnknownKind(u16),

    #[error("Unsupported schema version {version} for entry kind {kind}")]
    UnsupportedVersion { kind: u16, version: u16 },

    #[error("Length mismatch: header declares {declared} bytes, body has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Malformed body: {0}")]
    Body(String),
}

/// 存储相关错误
#[derive(Debug, Error, Clone)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Append backpressure: {pending} bytes pending, limit {limit}")]
    Backpressure { pending: u64, limit: u64 },

    #[error("Non-monotonic append: {0}")]
    NonMonotonic(String),

    #[error("Log entry at index {0} not found")]
    EntryNotFound(LogIndex),

    #[error("Log entry at index {0} has been compacted")]
    Compacted(LogIndex),

    #[error("Cannot truncate after {after}: commit index is {commit_index}")]
    TruncateCommitted {
        after: LogIndex,
        commit_index: LogIndex,
    },

    #[error("Cannot compact up to {up_to}: latest snapshot covers {snapshot_index}")]
    CompactionBeyondSnapshot {
        up_to: LogIndex,
        snapshot_index: LogIndex,
    },

    #[error("Corrupted data in {segment} at offset {offset}")]
    DataCorruption { segment: String, offset: u64 },

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Log writer closed")]
    Closed,
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(Arc::new(e))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// 快照相关错误
#[derive(Debug, Error, Clone)]
pub enum SnapshotError {
    #[error("Snapshot IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Snapshot at position {0} is corrupted")]
    DataCorrupted(LogIndex),

    #[error("Invalid snapshot metadata: {0}")]
    InvalidMeta(String),
}

impl From<std::io::Error> for SnapshotError {
    fn from(e: std::io::Error) -> Self {
        SnapshotError::Io(Arc::new(e))
    }
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Errors of the per-partition state store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Failed to encode value in {cf}: {reason}")]
    Encode { cf: &'static str, reason: String },

    #[error("Failed to decode value in {cf}: {reason}")]
    Decode { cf: &'static str, reason: String },

    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    #[error("Invalid snapshot blob: {0}")]
    InvalidSnapshot(String),
}

pub type StateResult<T> = Result<T, StateError>;

/// Errors raised while applying committed entries. Domain rejections are not errors.
#[derive(Debug, Error, Clone)]
pub enum ProcessingError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Schema error at index {index}: {source}")]
    Schema { index: LogIndex, source: SchemaError },

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Unexpected handler failure at position {position}: {reason}")]
    Handler {
        position: RecordPosition,
        reason: String,
    },

    #[error("Partition failed at index {0}, no further entries are applied")]
    Failed(LogIndex),
}

pub type ProcessingResult<T> = Result<T, ProcessingError>;

// === 统一错误处理机制 ===
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The partition must stop applying entries.
    Fatal,
    /// Pause and retry the same operation later.
    Recoverable,
    /// Log and move on.
    Ignorable,
}

pub trait ErrorHandler {
    fn severity(&self) -> ErrorSeverity;
    fn context(&self) -> String;
}

impl ErrorHandler for SchemaError {
    fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Fatal
    }

    fn context(&self) -> String {
        format!("Schema error: {}", self)
    }
}

impl ErrorHandler for StorageError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            StorageError::Io(_) => ErrorSeverity::Fatal,
            StorageError::Backpressure { .. } => ErrorSeverity::Recoverable,
            StorageError::NonMonotonic(_) => ErrorSeverity::Fatal,
            StorageError::EntryNotFound(_) => ErrorSeverity::Recoverable,
            StorageError::Compacted(_) => ErrorSeverity::Fatal,
            StorageError::TruncateCommitted { .. } => ErrorSeverity::Ignorable,
            StorageError::CompactionBeyondSnapshot { .. } => ErrorSeverity::Ignorable,
            StorageError::DataCorruption { .. } => ErrorSeverity::Fatal,
            StorageError::Schema(_) => ErrorSeverity::Fatal,
            StorageError::Closed => ErrorSeverity::Fatal,
        }
    }

    fn context(&self) -> String {
        match self {
            StorageError::Io(e) => format!("IO error: {}", e),
            StorageError::Backpressure { pending, limit } => {
                format!("Backpressure: {} of {} bytes pending", pending, limit)
            }
            StorageError::NonMonotonic(msg) => format!("Non-monotonic append: {}", msg),
            StorageError::EntryNotFound(idx) => format!("Log entry at index {} not found", idx),
            StorageError::Compacted(idx) => format!("Log entry at index {} compacted", idx),
            StorageError::TruncateCommitted {
                after,
                commit_index,
            } => format!(
                "Refused to truncate after {} below commit index {}",
                after, commit_index
            ),
            StorageError::CompactionBeyondSnapshot {
                up_to,
                snapshot_index,
            } => format!(
                "Refused to compact up to {} beyond snapshot {}",
                up_to, snapshot_index
            ),
            StorageError::DataCorruption { segment, offset } => {
                format!("Data corruption in {} at offset {}", segment, offset)
            }
            StorageError::Schema(e) => format!("Schema error: {}", e),
            StorageError::Closed => "Log writer closed".to_string(),
        }
    }
}

impl ErrorHandler for SnapshotError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            SnapshotError::Io(_) => ErrorSeverity::Recoverable,
            SnapshotError::DataCorrupted(_) => ErrorSeverity::Fatal,
            SnapshotError::InvalidMeta(_) => ErrorSeverity::Fatal,
        }
    }

    fn context(&self) -> String {
        match self {
            SnapshotError::Io(e) => format!("Snapshot IO error: {}", e),
            SnapshotError::DataCorrupted(pos) => format!("Snapshot {} corrupted", pos),
            SnapshotError::InvalidMeta(msg) => format!("Invalid snapshot metadata: {}", msg),
        }
    }
}

impl ErrorHandler for StateError {
    fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Fatal
    }

    fn context(&self) -> String {
        format!("State error: {}", self)
    }
}

impl ErrorHandler for ProcessingError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            ProcessingError::Storage(e) => e.severity(),
            ProcessingError::Schema { .. } => ErrorSeverity::Fatal,
            ProcessingError::State(_) => ErrorSeverity::Fatal,
            ProcessingError::Handler { .. } => ErrorSeverity::Fatal,
            ProcessingError::Failed(_) => ErrorSeverity::Fatal,
        }
    }

    fn context(&self) -> String {
        match self {
            ProcessingError::Storage(e) => e.context(),
            ProcessingError::Schema { index, source } => {
                format!("Schema error at index {}: {}", index, source)
            }
            ProcessingError::State(e) => e.context(),
            ProcessingError::Handler { position, reason } => {
                format!("Handler failure at position {}: {}", position, reason)
            }
            ProcessingError::Failed(index) => format!("Partition failed at index {}", index),
        }
    }
}

/// Classifies failures of one partition and latches it once a fatal error is seen.
pub struct PartitionErrorHandler {
    partition_id: PartitionId,
    failure: Option<String>,
}

impl PartitionErrorHandler {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            failure: None,
        }
    }

    /// 统一处理错误, returns the severity so the caller can decide to retry.
    pub fn handle<E: ErrorHandler>(&mut self, err: &E, operation: &str) -> ErrorSeverity {
        let ctx = format!("{} on partition {}", operation, self.partition_id);
        let severity = err.severity();
        match severity {
            ErrorSeverity::Fatal => {
                error!(
                    "[FATAL] {} failed: {} - partition stops applying entries",
                    ctx,
                    err.context(),
                );
                if self.failure.is_none() {
                    self.failure = Some(err.context());
                }
            }
            ErrorSeverity::Recoverable => {
                warn!("[RECOVERABLE] {} failed: {} - will retry", ctx, err.context());
            }
            ErrorSeverity::Ignorable => {
                info!("[IGNORABLE] {} failed: {}", ctx, err.context());
            }
        }
        severity
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_is_recoverable() {
        let err = StorageError::Backpressure {
            pending: 10,
            limit: 5,
        };
        assert_eq!(err.severity(), ErrorSeverity::Recoverable);
        let wrapped = ProcessingError::from(err);
        assert_eq!(wrapped.severity(), ErrorSeverity::Recoverable);
    }

    #[test]
    fn test_io_and_schema_are_fatal() {
        let io = StorageError::from(std::io::Error::other("disk gone"));
        assert_eq!(io.severity(), ErrorSeverity::Fatal);

        let schema = ProcessingError::Schema {
            index: 3,
            source: SchemaError::UnknownKind(99),
        };
        assert_eq!(schema.severity(), ErrorSeverity::Fatal);
    }

    #[test]
    fn test_handler_latches_first_fatal_error() {
        let mut handler = PartitionErrorHandler::new(1);
        let recoverable = StorageError::Backpressure {
            pending: 2,
            limit: 1,
        };
        assert_eq!(handler.handle(&recoverable, "append"), ErrorSeverity::Recoverable);
        assert!(!handler.is_failed());

        handler.handle(&StorageError::Closed, "append");
        handler.handle(&StateError::Inconsistent("x".into()), "apply");
        assert!(handler.is_failed());
        assert_eq!(handler.failure(), Some("Log writer closed"));
    }
}
