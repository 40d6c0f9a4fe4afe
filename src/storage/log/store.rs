//! Segment store for one partition's log.
//!
//! This module provides:
//! - Monotonic log index assignment with term and record-position checks on append
//! - Automatic segment rotation when max size is reached
//! - Cross-segment reads and binary search over application record ranges
//! - Suffix truncation of uncommitted entries and prefix compaction behind a snapshot

use std::{fs, path::PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::entry::{self, IndexedEntry, RaftEntry};
use crate::error::{StorageError, StorageResult};
use crate::types::{LogIndex, RecordPosition, Term};

use super::entry::{ApplicationRange, RangeIndex, TruncateRecord};
use super::segment::{LogSegment, PreparedEntry};

/// Default maximum segment size (64MB)
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default cap on the bytes held by all segments of one log (4GB)
pub const DEFAULT_MAX_LOG_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Configuration options for the segment store
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentStoreOptions {
    /// Directory for storing segment files
    pub dir: PathBuf,
    /// Maximum segment size in bytes before rotation
    pub max_segment_size: u64,
    /// Appends fail with `Backpressure` once the segments would exceed this
    pub max_log_bytes: u64,
    /// Whether to sync after each write
    pub sync_on_write: bool,
}

impl Default for SegmentStoreOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/log"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
            sync_on_write: true,
        }
    }
}

impl SegmentStoreOptions {
    pub fn with_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }
}

/// Tail of the log used to validate appends.
#[derive(Debug, Clone, Copy)]
struct Tail {
    last_index: LogIndex,
    last_term: Term,
    next_position: RecordPosition,
    empty: bool,
}

impl Tail {
    fn check(&self, entry: &RaftEntry) -> Result<(), String> {
        let term = entry.term();
        if term < self.last_term {
            return Err(format!(
                "term {} of {} entry is below last term {}",
                term,
                entry.kind(),
                self.last_term
            ));
        }
        if entry.is_term_start() && !self.empty && term <= self.last_term {
            return Err(format!(
                "{} entry for term {} is not the first entry of its term",
                entry.kind(),
                term
            ));
        }
        if let Some(app) = entry.as_application() {
            if app.lowest_position > app.highest_position {
                return Err(format!(
                    "empty range [{}, {}]",
                    app.lowest_position, app.highest_position
                ));
            }
            if app.lowest_position != self.next_position {
                return Err(format!(
                    "range [{}, {}] does not start at next position {}",
                    app.lowest_position, app.highest_position, self.next_position
                ));
            }
        }
        Ok(())
    }

    fn advance(&mut self, entry: &RaftEntry) {
        self.last_index += 1;
        self.last_term = entry.term();
        self.empty = false;
        if let Some(app) = entry.as_application() {
            self.next_position = app.highest_position + 1;
        }
    }
}

struct StoreInner {
    /// Segments ordered by id; the last one is active (writable)
    segments: Vec<LogSegment>,
    next_segment_id: u64,
    /// First readable index; `last_index + 1` when the log is empty
    first_index: LogIndex,
    last_index: LogIndex,
    last_term: Term,
    ranges: RangeIndex,
    /// Highest index captured by a durable snapshot
    snapshot_index: LogIndex,
    /// Latest prefix truncation, re-recorded if its segment is removed
    compaction: Option<TruncateRecord>,
}

impl StoreInner {
    fn tail(&self) -> Tail {
        Tail {
            last_index: self.last_index,
            last_term: self.last_term,
            next_position: self.ranges.next_position(),
            empty: self.last_index < self.first_index,
        }
    }

    fn disk_usage(&self) -> u64 {
        self.segments.iter().map(|s| s.size()).sum()
    }

    fn segment_for(&self, index: LogIndex) -> Option<&LogSegment> {
        self.segments
            .iter()
            .rev()
            .find(|s| s.first_index().is_some_and(|first| first <= index))
            .filter(|s| s.index.is_valid_index(index))
    }

    fn term_of(&self, index: LogIndex) -> Option<Term> {
        self.segment_for(index)
            .and_then(|s| s.index.get_entry(index))
            .map(|meta| meta.term)
    }

    fn active(&mut self) -> &mut LogSegment {
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    /// Recomputes index bounds and the last term from the segments.
    fn refresh_bounds(&mut self) {
        let first = self.segments.iter().find_map(|s| s.first_index());
        let last = self.segments.iter().rev().find_map(|s| s.last_entry().cloned());
        let compacted_through = self
            .compaction
            .as_ref()
            .map_or(0, |r| r.truncate_index.saturating_sub(1));

        match (first, last) {
            (Some(first), Some(meta)) => {
                self.first_index = first;
                self.last_index = meta.log_index;
                self.last_term = meta.term;
            }
            _ => {
                self.first_index = compacted_through + 1;
                self.last_index = compacted_through;
                self.last_term = self.compaction.as_ref().map_or(0, |r| r.term);
            }
        }
    }
}

/// Append-only, segment-based storage of one partition's log
pub struct SegmentStore {
    options: SegmentStoreOptions,
    inner: RwLock<StoreInner>,
}

impl SegmentStore {
    /// Load existing segments from disk or create the first segment
    pub fn open(options: SegmentStoreOptions) -> StorageResult<Self> {
        fs::create_dir_all(&options.dir)?;

        let mut segment_files: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&options.dir)?.flatten() {
            let path = entry.path();
            if let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(LogSegment::parse_file_name)
            {
                segment_files.push((id, path));
            }
        }
        segment_files.sort_by_key(|(id, _)| *id);

        let mut segments = Vec::with_capacity(segment_files.len().max(1));
        for (id, path) in segment_files {
            segments.push(LogSegment::open(path, id)?);
        }
        if segments.is_empty() {
            segments.push(LogSegment::create(&options.dir, 0)?);
        }
        let next_segment_id = segments.last().map_or(0, |s| s.segment_id) + 1;

        // The newest prefix truncation applies to every segment.
        let compaction = segments
            .iter()
            .filter_map(|s| s.prefix_truncation.clone())
            .max_by_key(|r| r.truncate_index);
        if let Some(record) = &compaction {
            for segment in &mut segments {
                segment.index.truncate_prefix(record.truncate_index);
            }
        }

        let mut ranges = RangeIndex::new(compaction.as_ref().map_or(1, |r| r.next_position));
        for segment in &segments {
            for range in &segment.index.ranges {
                ranges.push(*range);
            }
        }

        let mut inner = StoreInner {
            segments,
            next_segment_id,
            first_index: 1,
            last_index: 0,
            last_term: 0,
            ranges,
            snapshot_index: 0,
            compaction,
        };
        inner.refresh_bounds();

        info!(
            "Opened segment store {:?}: entries [{}, {}], {} segments, {} application ranges",
            options.dir,
            inner.first_index,
            inner.last_index,
            inner.segments.len(),
            inner.ranges.len()
        );

        Ok(Self {
            options,
            inner: RwLock::new(inner),
        })
    }

    pub fn options(&self) -> &SegmentStoreOptions {
        &self.options
    }

    pub fn first_index(&self) -> LogIndex {
        self.inner.read().first_index
    }

    pub fn last_index(&self) -> LogIndex {
        self.inner.read().last_index
    }

    pub fn last_term(&self) -> Term {
        self.inner.read().last_term
    }

    /// Position the next application entry has to start at.
    pub fn next_record_position(&self) -> RecordPosition {
        self.inner.read().ranges.next_position()
    }

    pub fn disk_usage(&self) -> u64 {
        self.inner.read().disk_usage()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.read().segments.len()
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.inner.read().snapshot_index
    }

    /// Appends one entry and returns the log index assigned to it.
    pub fn append(&self, entry: &RaftEntry) -> StorageResult<LogIndex> {
        self.append_batch(std::slice::from_ref(entry), self.options.sync_on_write)
    }

    /// Appends all entries or none of them; returns the index of the last one.
    pub fn append_batch(&self, entries: &[RaftEntry], sync: bool) -> StorageResult<LogIndex> {
        let mut inner = self.inner.write();
        if entries.is_empty() {
            return Ok(inner.last_index);
        }

        let mut tail = inner.tail();
        let mut prepared = Vec::with_capacity(entries.len());
        let mut bytes = 0u64;
        for entry in entries {
            tail.check(entry).map_err(|reason| {
                warn!("Rejected append: {}", reason);
                StorageError::NonMonotonic(reason)
            })?;
            tail.advance(entry);
            let data = entry::encode(entry)?;
            bytes += data.len() as u64;
            prepared.push(PreparedEntry {
                log_index: tail.last_index,
                term: entry.term(),
                data,
                range: entry
                    .as_application()
                    .map(|app| (app.lowest_position, app.highest_position)),
            });
        }

        let used = inner.disk_usage();
        if used + bytes > self.options.max_log_bytes {
            warn!(
                "Log would grow to {} bytes, limit {}",
                used + bytes,
                self.options.max_log_bytes
            );
            return Err(StorageError::Backpressure {
                pending: used + bytes,
                limit: self.options.max_log_bytes,
            });
        }

        self.maybe_rotate(&mut inner)?;
        let active = inner.active();
        active.write_log_entries(&prepared)?;
        if sync {
            active.sync_data()?;
        }

        for entry in &prepared {
            if let Some((lowest, highest)) = entry.range {
                inner.ranges.push(ApplicationRange {
                    lowest,
                    highest,
                    log_index: entry.log_index,
                });
            }
        }
        if inner.last_index < inner.first_index {
            inner.first_index = prepared[0].log_index;
        }
        inner.last_index = tail.last_index;
        inner.last_term = tail.last_term;

        debug!(
            "Appended {} entries, last index {}",
            prepared.len(),
            inner.last_index
        );
        Ok(inner.last_index)
    }

    /// Flushes the active segment.
    pub fn sync(&self) -> StorageResult<()> {
        let inner = self.inner.read();
        match inner.segments.last() {
            Some(active) => active.sync_data(),
            None => Ok(()),
        }
    }

    /// Rotate to a new segment if the active one is full
    fn maybe_rotate(&self, inner: &mut StoreInner) -> StorageResult<()> {
        let active = inner.active();
        if active.size() < self.options.max_segment_size || active.index.is_empty() {
            return Ok(());
        }
        active.sync_data()?;

        let segment = LogSegment::create(&self.options.dir, inner.next_segment_id)?;
        inner.next_segment_id += 1;
        inner.segments.push(segment);
        info!(
            "Rotated log to segment {} ({} segments)",
            inner.next_segment_id - 1,
            inner.segments.len()
        );
        Ok(())
    }

    pub fn read(&self, index: LogIndex) -> StorageResult<IndexedEntry> {
        let inner = self.inner.read();
        if index < inner.first_index && index > 0 {
            return Err(StorageError::Compacted(index));
        }
        let segment = inner
            .segment_for(index)
            .ok_or(StorageError::EntryNotFound(index))?;
        let entry = segment.read_entry(index)?;
        Ok(IndexedEntry::new(index, entry))
    }

    /// Reads `low..=high`, clamped to the stored entries.
    pub fn read_range(&self, low: LogIndex, high: LogIndex) -> StorageResult<Vec<IndexedEntry>> {
        let (low, high) = {
            let inner = self.inner.read();
            (low.max(inner.first_index), high.min(inner.last_index))
        };
        (low..=high).map(|index| self.read(index)).collect()
    }

    /// Locates the application entry holding record `position` by binary search over
    /// the range index. Positions in gaps, compacted away or beyond the head give `None`.
    pub fn find_application_entry_containing(
        &self,
        position: RecordPosition,
    ) -> StorageResult<Option<IndexedEntry>> {
        let range = self.inner.read().ranges.find(position);
        match range {
            Some(range) => self.read(range.log_index).map(Some),
            None => Ok(None),
        }
    }

    /// Application ranges currently indexed, oldest first.
    pub fn application_ranges(&self) -> Vec<ApplicationRange> {
        self.inner.read().ranges.ranges().to_vec()
    }

    /// Discards every entry above `after`. Committed entries are never removed.
    pub fn truncate_suffix(&self, after: LogIndex, commit_index: LogIndex) -> StorageResult<()> {
        if after < commit_index {
            return Err(StorageError::TruncateCommitted {
                after,
                commit_index,
            });
        }
        let mut inner = self.inner.write();
        if after >= inner.last_index {
            return Ok(());
        }

        // Whole segments above `after` go away; the one holding `after` becomes active.
        let mut removed_compaction_record = false;
        while inner.segments.len() > 1 {
            let beyond = inner
                .segments
                .last()
                .is_some_and(|s| s.first_index().is_none_or(|first| first > after));
            if !beyond {
                break;
            }
            if let Some(segment) = inner.segments.pop() {
                removed_compaction_record |= segment.prefix_truncation.is_some();
                info!("Removing segment {} during suffix truncation", segment.segment_id);
                if let Err(e) = fs::remove_file(&segment.file_path) {
                    warn!("Failed to remove segment {:?}: {}", segment.file_path, e);
                }
            }
        }

        let compaction = inner.compaction.clone();
        let active = inner.active();
        active.write_truncate_suffix(after)?;
        if removed_compaction_record {
            if let Some(record) = compaction {
                active.write_truncate_prefix(record)?;
            }
        }
        active.sync_data()?;

        inner.ranges.truncate_after(after);
        inner.refresh_bounds();
        info!(
            "Truncated log after index {}, last index now {}",
            after, inner.last_index
        );
        Ok(())
    }

    /// Records that a durable snapshot covers every entry up to `index`.
    pub fn set_snapshot_index(&self, index: LogIndex) {
        let mut inner = self.inner.write();
        inner.snapshot_index = inner.snapshot_index.max(index);
    }

    /// Removes entries up to `up_to`, never past the latest snapshot.
    pub fn compact(&self, up_to: LogIndex) -> StorageResult<()> {
        let mut inner = self.inner.write();
        if up_to > inner.snapshot_index {
            return Err(StorageError::CompactionBeyondSnapshot {
                up_to,
                snapshot_index: inner.snapshot_index,
            });
        }
        if up_to < inner.first_index {
            return Ok(());
        }
        let up_to = up_to.min(inner.last_index);

        let record = TruncateRecord {
            truncate_index: up_to + 1,
            term: inner.term_of(up_to).unwrap_or(inner.last_term),
            next_position: inner
                .ranges
                .ranges()
                .iter()
                .find(|r| r.log_index > up_to)
                .map_or(inner.ranges.next_position(), |r| r.lowest),
        };
        let active = inner.active();
        active.write_truncate_prefix(record.clone())?;
        active.sync_data()?;

        let active_id = inner.active().segment_id;
        for segment in &mut inner.segments {
            segment.index.truncate_prefix(record.truncate_index);
        }

        // Delete sealed segments that no longer hold any entry.
        let mut kept = Vec::with_capacity(inner.segments.len());
        for segment in inner.segments.drain(..) {
            if segment.segment_id != active_id && segment.index.is_empty() {
                info!("Deleting compacted segment {:?}", segment.file_path);
                if let Err(e) = fs::remove_file(&segment.file_path) {
                    warn!("Failed to delete segment {:?}: {}", segment.file_path, e);
                }
            } else {
                kept.push(segment);
            }
        }
        inner.segments = kept;

        inner.ranges.compact_before(record.truncate_index);
        inner.compaction = Some(record);
        inner.refresh_bounds();
        info!(
            "Compacted log up to index {}, first index now {}",
            up_to, inner.first_index
        );
        Ok(())
    }
}
