use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::entry::{self, RaftEntry};
use crate::error::{StorageError, StorageResult};
use crate::types::{LogIndex, RecordPosition, Term};

use super::entry::{
    ENTRY_HEADER_SIZE, EntryMeta, FrameHeader, FrameType, LogEntryRecord, SegmentIndex,
    TruncateRecord, encode_frame,
};

// LogSegment file format:
// | FrameHeader [ logEntry | truncatePrefix | truncateSuffix ] | FrameHeader [...] | ...
//
// Segments are append-only; truncation is recorded as a frame and applied to the
// in-memory index, both when written and when the segment is replayed on open.

/// Segment file prefix
const SEGMENT_FILE_PREFIX: &str = "segment_";

/// Segment file extension
const SEGMENT_FILE_EXT: &str = ".log";

/// One entry ready to be written: log index, term, encoded bytes and application range.
#[derive(Debug, Clone)]
pub struct PreparedEntry {
    pub log_index: LogIndex,
    pub term: Term,
    pub data: Vec<u8>,
    pub range: Option<(RecordPosition, RecordPosition)>,
}

pub struct LogSegment {
    pub(crate) segment_id: u64,
    pub(crate) file_path: PathBuf,
    pub(crate) file: File,
    pub(crate) index: SegmentIndex,
    /// Write offset; bytes past it are torn frames from a crash.
    pub(crate) size: u64,
    /// Highest prefix truncation recorded in this segment.
    pub(crate) prefix_truncation: Option<TruncateRecord>,
}

impl LogSegment {
    pub fn file_name(segment_id: u64) -> String {
        format!("{}{:010}{}", SEGMENT_FILE_PREFIX, segment_id, SEGMENT_FILE_EXT)
    }

    /// Extract segment ID from filename
    pub fn parse_file_name(name: &str) -> Option<u64> {
        if !name.starts_with(SEGMENT_FILE_PREFIX) || !name.ends_with(SEGMENT_FILE_EXT) {
            return None;
        }
        name.trim_start_matches(SEGMENT_FILE_PREFIX)
            .trim_end_matches(SEGMENT_FILE_EXT)
            .parse::<u64>()
            .ok()
    }

    /// Create a new, empty segment file
    pub fn create(dir: &Path, segment_id: u64) -> StorageResult<Self> {
        let file_path = dir.join(Self::file_name(segment_id));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&file_path)?;

        info!("Created new segment: id={}, path={:?}", segment_id, file_path);

        Ok(Self {
            segment_id,
            file_path,
            file,
            index: SegmentIndex::default(),
            size: 0,
            prefix_truncation: None,
        })
    }

    /// Load an existing segment from disk and replay it to rebuild the index
    pub fn open(file_path: PathBuf, segment_id: u64) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&file_path)?;

        let mut segment = Self {
            segment_id,
            file_path,
            file,
            index: SegmentIndex::default(),
            size: 0,
            prefix_truncation: None,
        };
        segment.replay_segment()?;

        info!(
            "Loaded segment: id={}, size={}, entries={}",
            segment_id,
            segment.size,
            segment.index.entries.len()
        );
        Ok(segment)
    }

    pub fn first_index(&self) -> Option<LogIndex> {
        (!self.index.is_empty()).then_some(self.index.first_log_index)
    }

    pub fn last_index(&self) -> Option<LogIndex> {
        (!self.index.is_empty()).then_some(self.index.last_log_index)
    }

    pub fn last_entry(&self) -> Option<&EntryMeta> {
        self.index.entries.last()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sync_data(&self) -> StorageResult<()> {
        self.file.sync_data().map_err(|e| {
            warn!("Failed to sync log segment file data: {}", e);
            e.into()
        })
    }

    fn write_at_end(&mut self, buf: &[u8]) -> StorageResult<()> {
        self.file.write_all_at(buf, self.size).map_err(|e| {
            warn!("Failed to write to log segment {:?}: {}", self.file_path, e);
            StorageError::from(e)
        })?;
        self.size += buf.len() as u64;
        Ok(())
    }

    /// Appends entries as one contiguous write. The caller syncs.
    pub fn write_log_entries(&mut self, entries: &[PreparedEntry]) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut offset = self.size;
        let mut buf = Vec::new();
        let mut metas = Vec::with_capacity(entries.len());
        for entry in entries {
            let payload = LogEntryRecord::serialize(entry.log_index, &entry.data);
            let frame = encode_frame(&payload, FrameType::LogEntry);
            // Include header size in offset calculation
            metas.push(EntryMeta {
                log_index: entry.log_index,
                term: entry.term,
                offset: offset + ENTRY_HEADER_SIZE as u64,
                size: payload.len() as u64,
            });
            offset += frame.len() as u64;
            buf.extend_from_slice(&frame);
        }

        self.write_at_end(&buf)?;

        // update index
        for (meta, entry) in metas.into_iter().zip(entries) {
            self.index.push(meta, entry.range);
        }
        Ok(())
    }

    /// Write a truncate prefix operation to the log segment
    /// This marks all entries before `record.truncate_index` as invalid
    pub fn write_truncate_prefix(&mut self, record: TruncateRecord) -> StorageResult<()> {
        let payload = record.serialize()?;
        self.write_at_end(&encode_frame(&payload, FrameType::TruncatePrefix))?;
        self.index.truncate_prefix(record.truncate_index);
        self.prefix_truncation = Some(record);
        Ok(())
    }

    /// Write a truncate suffix operation to the log segment
    /// This marks all entries after `index` as invalid
    pub fn write_truncate_suffix(&mut self, index: LogIndex) -> StorageResult<()> {
        let record = TruncateRecord {
            truncate_index: index,
            term: 0,
            next_position: 0,
        };
        let payload = record.serialize()?;
        self.write_at_end(&encode_frame(&payload, FrameType::TruncateSuffix))?;
        self.index.truncate_suffix(index);
        Ok(())
    }

    /// Replay the log segment to rebuild the index from scratch.
    ///
    /// A frame with a bad header or CRC ends the replay: it is the torn tail of a write
    /// interrupted by a crash, and the file is cut back to the last good frame.
    pub fn replay_segment(&mut self) -> StorageResult<()> {
        self.index = SegmentIndex::default();
        self.prefix_truncation = None;

        let file_size = self.file.metadata()?.len();
        let mut offset: u64 = 0;
        let mut header_buf = [0u8; ENTRY_HEADER_SIZE as usize];

        while offset < file_size {
            if offset + ENTRY_HEADER_SIZE as u64 > file_size {
                warn!("Incomplete header at offset {}, stopping replay", offset);
                break;
            }
            self.file.read_exact_at(&mut header_buf, offset)?;

            let header = match FrameHeader::deserialize(&header_buf) {
                Some(h) => h,
                None => {
                    warn!("Invalid frame header at offset {}, stopping replay", offset);
                    break;
                }
            };

            let data_size = header.payload_size();
            let data_offset = offset + ENTRY_HEADER_SIZE as u64;
            if data_offset + data_size > file_size {
                warn!("Incomplete frame at offset {}, stopping replay", offset);
                break;
            }

            let mut data_buf = vec![0u8; data_size as usize];
            self.file.read_exact_at(&mut data_buf, data_offset)?;

            let actual_crc = crc32fast::hash(&data_buf);
            if actual_crc != header.crc {
                warn!(
                    "CRC mismatch at offset {}: expected {}, got {}",
                    offset, header.crc, actual_crc
                );
                break;
            }

            match header.frame_type {
                FrameType::LogEntry => {
                    let (log_index, data) =
                        LogEntryRecord::split(&data_buf).ok_or_else(|| {
                            StorageError::DataCorruption {
                                segment: self.file_path.display().to_string(),
                                offset,
                            }
                        })?;
                    let term = entry::peek_term(data)?;
                    let range = entry::peek_application_range(data)?;
                    let meta = EntryMeta {
                        log_index,
                        term,
                        offset: data_offset,
                        size: data_size,
                    };
                    self.index.push(meta, range);
                }
                FrameType::TruncatePrefix => {
                    if let Some(record) = TruncateRecord::deserialize(&data_buf) {
                        self.index.truncate_prefix(record.truncate_index);
                        let newer = self
                            .prefix_truncation
                            .as_ref()
                            .is_none_or(|r| r.truncate_index < record.truncate_index);
                        if newer {
                            self.prefix_truncation = Some(record);
                        }
                    }
                }
                FrameType::TruncateSuffix => {
                    if let Some(record) = TruncateRecord::deserialize(&data_buf) {
                        self.index.truncate_suffix(record.truncate_index);
                    }
                }
            }

            offset += header.size as u64;
        }

        if offset < file_size {
            warn!(
                "Discarding {} torn bytes at the end of {:?}",
                file_size - offset,
                self.file_path
            );
            self.file.set_len(offset)?;
        }
        self.size = offset;
        debug!(
            "Replayed segment {}: {} entries, {} ranges",
            self.segment_id,
            self.index.entries.len(),
            self.index.ranges.len()
        );
        Ok(())
    }

    /// Reads the encoded bytes of the entry at `log_index`.
    fn read_raw(&self, log_index: LogIndex) -> StorageResult<Vec<u8>> {
        let meta = self
            .index
            .get_entry(log_index)
            .ok_or(StorageError::EntryNotFound(log_index))?;

        let mut buf = vec![0u8; meta.size as usize];
        self.file.read_exact_at(&mut buf, meta.offset).map_err(|e| {
            warn!("Failed to read log entry from file: {}", e);
            StorageError::from(e)
        })?;

        let corrupted = || StorageError::DataCorruption {
            segment: self.file_path.display().to_string(),
            offset: meta.offset,
        };
        let (stored_index, data) = LogEntryRecord::split(&buf).ok_or_else(corrupted)?;
        if stored_index != log_index {
            return Err(corrupted());
        }
        Ok(data.to_vec())
    }

    pub fn read_entry(&self, log_index: LogIndex) -> StorageResult<RaftEntry> {
        let data = self.read_raw(log_index)?;
        Ok(entry::decode(&data)?)
    }
}
