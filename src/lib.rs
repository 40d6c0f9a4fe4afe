//! flowraft: a partitioned workflow engine on top of a replicated log.
//!
//! Every partition owns one log. Client sessions append commands to it, a
//! deterministic [`StreamProcessor`](processing::StreamProcessor) turns committed
//! commands into events and follow-up commands, and writes those back as application
//! entries. Applying the same log always yields the same state, so followers only
//! replay what the leader wrote.

pub mod entry;
pub mod error;
pub mod log_stream;
pub mod partition;
pub mod processing;
pub mod record;
pub mod state;
pub mod storage;
pub mod types;

pub use entry::{IndexedEntry, RaftEntry};
pub use error::{EngineError, ErrorSeverity};
pub use log_stream::{CommitFeed, EntryAppender, LocalLog};
pub use partition::{
    Partition, PartitionHandle, PartitionHealth, PartitionManager, PartitionOptions,
    PartitionRole, Query, QueryRequest, QueryResponse, SessionClient,
};
pub use processing::{CommandResponse, HandlerRegistry, Outcome, response_channel};
pub use record::{Intent, Record, RecordValue, RejectionType};
pub use types::{Key, LogIndex, PartitionId, RecordPosition, SessionId, Term};
