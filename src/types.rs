use std::time::{SystemTime, UNIX_EPOCH};

// 类型定义
pub type PartitionId = u32;
pub type Term = u64;
/// Index of an entry in one partition's log (1-based, 0 means "none").
pub type LogIndex = u64;
/// Position of an application record inside the batched application entries.
pub type RecordPosition = u64;
pub type Key = u64;
pub type SessionId = u64;
/// Milliseconds since the unix epoch.
pub type Timestamp = u64;

/// Leader wall clock in milliseconds. Only written into entries, never read by handlers.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
