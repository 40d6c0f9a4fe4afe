//! Snapshot storage.
//!
//! One snapshot is kept per partition, stored next to a metadata file and a checksum.
//!
//! # Directory Structure
//!
//! ```text
//! {base_dir}/
//! └── partition-{id}/
//!     └── snapshot/
//!         ├── meta.json       # Snapshot metadata (index, term, size, checksum)
//!         ├── data.bin        # Exported state
//!         └── checksum.sha256 # Data checksum for integrity verification
//! ```
//!
//! Writes go to temporary files that are renamed into place, so a crash leaves either
//! the previous or the new snapshot.

mod store;


use async_trait::async_trait;

use crate::error::SnapshotResult;
use crate::types::{LogIndex, PartitionId, Term};

pub use store::{FileSnapshotStorage, SnapshotMeta, SnapshotStorageOptions};

/// Exported partition state covering every entry up to `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub index: LogIndex,
    pub term: Term,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    async fn save_snapshot(
        &self,
        partition_id: PartitionId,
        snapshot: Snapshot,
    ) -> SnapshotResult<()>;

    async fn load_snapshot(&self, partition_id: PartitionId) -> SnapshotResult<Option<Snapshot>>;
}
