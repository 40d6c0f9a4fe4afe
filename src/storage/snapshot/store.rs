//! File-based snapshot storage implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::error::{SnapshotError, SnapshotResult};
use crate::types::{LogIndex, PartitionId, Term, now_millis};

use super::{Snapshot, SnapshotStorage};

/// Snapshot storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotStorageOptions {
    /// Base directory for storing snapshots.
    pub base_dir: PathBuf,
    /// Whether to verify checksums when loading snapshots.
    pub verify_checksum: bool,
    /// Whether to sync data to disk after writes.
    pub sync_on_write: bool,
}

impl Default for SnapshotStorageOptions {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data/snapshots"),
            verify_checksum: true,
            sync_on_write: true,
        }
    }
}

impl SnapshotStorageOptions {
    /// Create options with a custom base directory.
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

/// Snapshot metadata stored separately for quick access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Last log index applied into the snapshot.
    pub index: LogIndex,
    pub term: Term,
    /// SHA256 checksum of the data file.
    pub checksum: String,
    pub data_size: u64,
    /// Milliseconds since the epoch.
    pub created_at: u64,
}

fn io_error(context: String, e: std::io::Error) -> SnapshotError {
    SnapshotError::Io(Arc::new(std::io::Error::new(
        e.kind(),
        format!("{}: {}", context, e),
    )))
}

/// File-based snapshot storage, one snapshot per partition.
///
/// Note: No in-memory caching is used since snapshots can be very large.
/// Each load reads directly from disk.
#[derive(Clone)]
pub struct FileSnapshotStorage {
    options: SnapshotStorageOptions,
}

impl FileSnapshotStorage {
    pub fn new(options: SnapshotStorageOptions) -> SnapshotResult<Self> {
        fs::create_dir_all(&options.base_dir).map_err(|e| {
            io_error(
                format!("Failed to create snapshot base directory {:?}", options.base_dir),
                e,
            )
        })?;

        info!(
            "FileSnapshotStorage initialized with base_dir: {:?}",
            options.base_dir
        );

        Ok(Self { options })
    }

    fn snapshot_dir(&self, partition_id: PartitionId) -> PathBuf {
        self.options
            .base_dir
            .join(format!("partition-{}", partition_id))
            .join("snapshot")
    }

    fn meta_path(&self, partition_id: PartitionId) -> PathBuf {
        self.snapshot_dir(partition_id).join("meta.json")
    }

    fn data_path(&self, partition_id: PartitionId) -> PathBuf {
        self.snapshot_dir(partition_id).join("data.bin")
    }

    fn checksum_path(&self, partition_id: PartitionId) -> PathBuf {
        self.snapshot_dir(partition_id).join("checksum.sha256")
    }

    pub(crate) fn calculate_checksum(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    pub(crate) fn verify_checksum(data: &[u8], expected: &str) -> bool {
        Self::calculate_checksum(data) == expected
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> SnapshotResult<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| io_error(format!("Failed to create {:?}", path), e))?;
        file.write_all(data)
            .map_err(|e| io_error(format!("Failed to write {:?}", path), e))?;
        if self.options.sync_on_write {
            file.sync_all()
                .map_err(|e| io_error(format!("Failed to sync {:?}", path), e))?;
        }
        Ok(())
    }

    /// Write snapshot atomically using temporary files.
    fn write_snapshot_atomic(
        &self,
        partition_id: PartitionId,
        snapshot: &Snapshot,
    ) -> SnapshotResult<()> {
        let snapshot_dir = self.snapshot_dir(partition_id);
        fs::create_dir_all(&snapshot_dir).map_err(|e| {
            io_error(
                format!("Failed to create snapshot directory {:?}", snapshot_dir),
                e,
            )
        })?;

        let checksum = Self::calculate_checksum(&snapshot.data);
        let meta = SnapshotMeta {
            index: snapshot.index,
            term: snapshot.term,
            checksum: checksum.clone(),
            data_size: snapshot.data.len() as u64,
            created_at: now_millis(),
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| SnapshotError::InvalidMeta(e.to_string()))?;

        let data_path = self.data_path(partition_id);
        let data_tmp_path = data_path.with_extension("bin.tmp");
        self.write_file(&data_tmp_path, &snapshot.data)?;

        let meta_path = self.meta_path(partition_id);
        let meta_tmp_path = meta_path.with_extension("json.tmp");
        self.write_file(&meta_tmp_path, meta_json.as_bytes())?;

        let checksum_path = self.checksum_path(partition_id);
        let checksum_tmp_path = checksum_path.with_extension("sha256.tmp");
        self.write_file(&checksum_tmp_path, checksum.as_bytes())?;

        // Data first; the metadata rename publishes the snapshot.
        fs::rename(&data_tmp_path, &data_path)
            .map_err(|e| io_error("Failed to rename data file".to_string(), e))?;
        fs::rename(&checksum_tmp_path, &checksum_path)
            .map_err(|e| io_error("Failed to rename checksum file".to_string(), e))?;
        fs::rename(&meta_tmp_path, &meta_path).map_err(|e| {
            let _ = fs::remove_file(&data_path);
            io_error("Failed to rename meta file".to_string(), e)
        })?;

        debug!(
            "Snapshot saved for partition {}: index={}, term={}, size={}",
            partition_id,
            snapshot.index,
            snapshot.term,
            snapshot.data.len()
        );
        Ok(())
    }

    fn read_meta(&self, partition_id: PartitionId) -> SnapshotResult<Option<SnapshotMeta>> {
        let meta_path = self.meta_path(partition_id);
        if !meta_path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&meta_path)
            .map_err(|e| io_error(format!("Failed to read metadata file {:?}", meta_path), e))?;
        let meta = serde_json::from_str(&content)
            .map_err(|e| SnapshotError::InvalidMeta(e.to_string()))?;
        Ok(Some(meta))
    }

    fn read_snapshot(&self, partition_id: PartitionId) -> SnapshotResult<Option<Snapshot>> {
        let data_path = self.data_path(partition_id);
        let meta = match self.read_meta(partition_id)? {
            Some(meta) if data_path.exists() => meta,
            _ => return Ok(None),
        };

        let mut data_file = File::open(&data_path)
            .map_err(|e| io_error(format!("Failed to open data file {:?}", data_path), e))?;
        let mut data = Vec::with_capacity(meta.data_size as usize);
        data_file
            .read_to_end(&mut data)
            .map_err(|e| io_error("Failed to read snapshot data".to_string(), e))?;

        let intact =
            || data.len() as u64 == meta.data_size && Self::verify_checksum(&data, &meta.checksum);
        if self.options.verify_checksum && !intact() {
            error!(
                "Snapshot checksum verification failed for partition {}",
                partition_id
            );
            return Err(SnapshotError::DataCorrupted(meta.index));
        }

        debug!(
            "Snapshot loaded for partition {}: index={}, term={}",
            partition_id, meta.index, meta.term
        );
        Ok(Some(Snapshot {
            index: meta.index,
            term: meta.term,
            data,
        }))
    }

    /// Get snapshot metadata without loading data.
    pub fn snapshot_meta(&self, partition_id: PartitionId) -> SnapshotResult<Option<SnapshotMeta>> {
        self.read_meta(partition_id)
    }

    pub fn delete_snapshot(&self, partition_id: PartitionId) -> SnapshotResult<()> {
        let snapshot_dir = self.snapshot_dir(partition_id);
        if snapshot_dir.exists() {
            fs::remove_dir_all(&snapshot_dir).map_err(|e| {
                io_error(
                    format!("Failed to delete snapshot directory {:?}", snapshot_dir),
                    e,
                )
            })?;
            info!("Snapshot deleted for partition {}", partition_id);
        }
        Ok(())
    }
}

fn join_error(e: tokio::task::JoinError) -> SnapshotError {
    SnapshotError::Io(Arc::new(std::io::Error::other(format!(
        "Snapshot task failed: {}",
        e
    ))))
}

#[async_trait]
impl SnapshotStorage for FileSnapshotStorage {
    async fn save_snapshot(
        &self,
        partition_id: PartitionId,
        snapshot: Snapshot,
    ) -> SnapshotResult<()> {
        let storage = self.clone();
        tokio::task::spawn_blocking(move || storage.write_snapshot_atomic(partition_id, &snapshot))
            .await
            .map_err(join_error)?
    }

    async fn load_snapshot(&self, partition_id: PartitionId) -> SnapshotResult<Option<Snapshot>> {
        let storage = self.clone();
        tokio::task::spawn_blocking(move || storage.read_snapshot(partition_id))
            .await
            .map_err(join_error)?
    }
}
