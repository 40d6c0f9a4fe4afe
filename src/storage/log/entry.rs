use bincode::{Decode, Encode};
use tracing::warn;

use crate::error::{SchemaError, StorageError, StorageResult};
use crate::types::{LogIndex, RecordPosition, Term};

#[derive(Debug, Default, Decode, Encode, Clone, PartialEq, Eq, Hash)]
pub struct EntryMeta {
    pub log_index: LogIndex,
    pub term: Term,
    /// File offset of the frame payload (after the frame header).
    pub offset: u64,
    pub size: u64,
}

/// Represents a truncate operation record stored in the log segment
#[derive(Debug, Clone, PartialEq, Eq, Decode, Encode)]
pub struct TruncateRecord {
    pub truncate_index: LogIndex,
    /// Term of the entry just below `truncate_index` (prefix truncation only).
    pub term: Term,
    /// Lowest record position of the entries kept by a prefix truncation.
    pub next_position: RecordPosition,
}

impl TruncateRecord {
    pub fn serialize(&self) -> StorageResult<Vec<u8>> {
        let config = bincode::config::standard();
        bincode::encode_to_vec(self, config)
            .map_err(|e| StorageError::Schema(SchemaError::Body(e.to_string())))
    }

    pub fn deserialize(data: &[u8]) -> Option<Self> {
        let config = bincode::config::standard();
        match bincode::decode_from_slice(data, config) {
            Ok((record, _)) => Some(record),
            Err(e) => {
                warn!("Failed to deserialize truncate record: {}", e);
                None
            }
        }
    }
}

/// Frame payload of a log entry: the log index followed by the encoded entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntryRecord {
    pub log_index: LogIndex,
    pub data: Vec<u8>,
}

impl LogEntryRecord {
    pub fn serialize(log_index: LogIndex, data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + data.len());
        buf.extend_from_slice(&log_index.to_le_bytes());
        buf.extend_from_slice(data);
        buf
    }

    /// Splits a payload into its log index and encoded entry bytes.
    pub fn split(payload: &[u8]) -> Option<(LogIndex, &[u8])> {
        if payload.len() < 8 {
            return None;
        }
        let mut index_bytes = [0u8; 8];
        index_bytes.copy_from_slice(&payload[0..8]);
        Some((u64::from_le_bytes(index_bytes), &payload[8..]))
    }
}

/// Range of record positions held by one application entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApplicationRange {
    pub lowest: RecordPosition,
    pub highest: RecordPosition,
    pub log_index: LogIndex,
}

/// Entry index of one segment
#[derive(Debug, Clone, Default)]
pub struct SegmentIndex {
    /// First valid log index (updated by TruncatePrefix)
    pub first_log_index: LogIndex,
    /// Last valid log index (updated by TruncateSuffix)
    pub last_log_index: LogIndex,
    /// Entry metadata list - entries[i] corresponds to log_index = first_log_index + i
    pub entries: Vec<EntryMeta>,
    /// Application ranges of the entries above, in log order
    pub ranges: Vec<ApplicationRange>,
}

impl SegmentIndex {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check if a log index is valid (not truncated)
    pub fn is_valid_index(&self, log_index: LogIndex) -> bool {
        !self.entries.is_empty()
            && log_index >= self.first_log_index
            && log_index <= self.last_log_index
    }

    /// Get entry meta for a given log index
    pub fn get_entry(&self, log_index: LogIndex) -> Option<&EntryMeta> {
        if !self.is_valid_index(log_index) {
            return None;
        }
        let offset = (log_index - self.first_log_index) as usize;
        self.entries.get(offset)
    }

    pub fn push(&mut self, meta: EntryMeta, range: Option<(RecordPosition, RecordPosition)>) {
        if self.entries.is_empty() {
            self.first_log_index = meta.log_index;
        }
        self.last_log_index = meta.log_index;
        if let Some((lowest, highest)) = range {
            self.ranges.push(ApplicationRange {
                lowest,
                highest,
                log_index: meta.log_index,
            });
        }
        self.entries.push(meta);
    }

    /// Truncate entries before the given index (exclusive - keeps the index)
    pub fn truncate_prefix(&mut self, index: LogIndex) {
        if self.entries.is_empty() || index <= self.first_log_index {
            return;
        }
        self.ranges.retain(|r| r.log_index >= index);
        if index > self.last_log_index {
            // Truncate everything
            self.entries.clear();
            return;
        }
        let remove_count = (index - self.first_log_index) as usize;
        self.entries.drain(0..remove_count.min(self.entries.len()));
        self.first_log_index = index;
    }

    /// Truncate entries after the given index (exclusive - keeps the index)
    pub fn truncate_suffix(&mut self, index: LogIndex) {
        if self.entries.is_empty() || index >= self.last_log_index {
            return;
        }
        self.ranges.retain(|r| r.log_index <= index);
        if index < self.first_log_index {
            // Truncate everything
            self.entries.clear();
            return;
        }
        let keep_count = (index - self.first_log_index + 1) as usize;
        self.entries.truncate(keep_count);
        self.last_log_index = index;
    }
}

/// Ordered, non-overlapping application ranges of the whole log.
///
/// Stored as a flat vector so lookups are a binary search over fixed-size records.
#[derive(Debug, Clone, Default)]
pub struct RangeIndex {
    ranges: Vec<ApplicationRange>,
    next_position: RecordPosition,
}

impl RangeIndex {
    pub fn new(next_position: RecordPosition) -> Self {
        Self {
            ranges: Vec::new(),
            next_position: next_position.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Position the next application entry has to start at.
    pub fn next_position(&self) -> RecordPosition {
        self.next_position
    }

    pub fn ranges(&self) -> &[ApplicationRange] {
        &self.ranges
    }

    pub fn push(&mut self, range: ApplicationRange) {
        self.next_position = range.highest + 1;
        self.ranges.push(range);
    }

    /// Binary search for the range holding `position`.
    pub fn find(&self, position: RecordPosition) -> Option<ApplicationRange> {
        let idx = self.ranges.partition_point(|r| r.highest < position);
        self.ranges
            .get(idx)
            .filter(|r| r.lowest <= position)
            .copied()
    }

    /// Drops ranges of entries above `index`.
    pub fn truncate_after(&mut self, index: LogIndex) {
        let keep = self.ranges.partition_point(|r| r.log_index <= index);
        if let Some(first_dropped) = self.ranges.get(keep) {
            self.next_position = first_dropped.lowest;
            self.ranges.truncate(keep);
        }
    }

    /// Drops ranges of entries below `index`; the next position is kept.
    pub fn compact_before(&mut self, index: LogIndex) {
        let remove = self.ranges.partition_point(|r| r.log_index < index);
        self.ranges.drain(0..remove);
    }
}

pub const ENTRY_MAGIC_NUM: u32 = 0x_1234_5678;
pub const ENTRY_HEADER_SIZE: u32 = 16; // 4 + 4 + 4 + 4 = 16 bytes

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    LogEntry,
    TruncatePrefix,
    TruncateSuffix,
}

impl FrameType {
    fn code(self) -> u32 {
        match self {
            FrameType::LogEntry => 1,
            FrameType::TruncatePrefix => 4,
            FrameType::TruncateSuffix => 5,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(FrameType::LogEntry),
            4 => Some(FrameType::TruncatePrefix),
            5 => Some(FrameType::TruncateSuffix),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame size including this header.
    pub size: u32,
    pub frame_type: FrameType,
    pub magic_num: u32,
    pub crc: u32,
}

impl FrameHeader {
    pub fn new(payload: &[u8], frame_type: FrameType) -> Self {
        Self {
            size: payload.len() as u32 + ENTRY_HEADER_SIZE,
            frame_type,
            magic_num: ENTRY_MAGIC_NUM,
            crc: crc32fast::hash(payload),
        }
    }

    pub fn serialize(&self) -> [u8; ENTRY_HEADER_SIZE as usize] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.frame_type.code().to_le_bytes());
        buf[8..12].copy_from_slice(&self.magic_num.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    /// Returns `None` for anything that is not a well-formed header.
    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < ENTRY_HEADER_SIZE as usize {
            return None;
        }
        let read_u32 = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&data[at..at + 4]);
            u32::from_le_bytes(bytes)
        };

        let size = read_u32(0);
        let frame_type = FrameType::from_code(read_u32(4))?;
        let magic_num = read_u32(8);
        let crc = read_u32(12);

        if magic_num != ENTRY_MAGIC_NUM || size < ENTRY_HEADER_SIZE {
            return None;
        }

        Some(Self {
            size,
            frame_type,
            magic_num,
            crc,
        })
    }

    pub fn payload_size(&self) -> u64 {
        (self.size - ENTRY_HEADER_SIZE) as u64
    }
}

/// Encodes one complete frame (header + payload).
pub fn encode_frame(payload: &[u8], frame_type: FrameType) -> Vec<u8> {
    let header = FrameHeader::new(payload, frame_type);
    let mut buf = Vec::with_capacity(header.size as usize);
    buf.extend_from_slice(&header.serialize());
    buf.extend_from_slice(payload);
    buf
}
