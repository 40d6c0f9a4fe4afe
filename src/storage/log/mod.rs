//! Log storage of one partition.
//!
//! All operations (append, truncate, compact) are written to log segments as frames;
//! truncation never rewrites data in place. Replaying the frames on open rebuilds the
//! entry index and the application range index.
//!
//! # Module Structure
//!
//! - `entry`: frame layout, truncation records and the in-memory indexes
//! - `segment`: log segment file operations
//! - `store`: multi-segment store with rotation, position lookup and compaction
//! - `writer`: batching async writer with backpressure and a durable-index watch

mod entry;
mod segment;
mod store;
mod writer;

#[cfg(test)]
mod tests;

pub use entry::{
    ApplicationRange, ENTRY_HEADER_SIZE as FRAME_HEADER_SIZE, ENTRY_MAGIC_NUM, EntryMeta,
    FrameHeader, FrameType, RangeIndex, TruncateRecord,
};
pub use segment::LogSegment;
pub use store::{DEFAULT_MAX_LOG_BYTES, DEFAULT_MAX_SEGMENT_SIZE, SegmentStore, SegmentStoreOptions};
pub use writer::{LogWriteOp, LogWriteRequest, LogWriter, LogWriterOptions};
