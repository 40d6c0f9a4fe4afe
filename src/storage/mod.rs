pub mod log;
pub mod snapshot;

pub use log::{LogWriter, LogWriterOptions, SegmentStore, SegmentStoreOptions};
pub use snapshot::{FileSnapshotStorage, Snapshot, SnapshotStorage, SnapshotStorageOptions};
