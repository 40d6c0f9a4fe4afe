//! Unit tests for the log storage module.

#[cfg(test)]
mod entry_tests {
    use crate::storage::log::entry::*;

    fn meta(log_index: u64, term: u64) -> EntryMeta {
        EntryMeta {
            log_index,
            term,
            offset: log_index * 10,
            size: 10,
        }
    }

    fn range(lowest: u64, highest: u64, log_index: u64) -> ApplicationRange {
        ApplicationRange {
            lowest,
            highest,
            log_index,
        }
    }

    #[test]
    fn test_truncate_record_serialization() {
        let record = TruncateRecord {
            truncate_index: 100,
            term: 3,
            next_position: 42,
        };
        let bytes = record.serialize().unwrap();
        assert_eq!(TruncateRecord::deserialize(&bytes), Some(record));
        assert!(TruncateRecord::deserialize(&[0xff]).is_none());
    }

    #[test]
    fn test_log_entry_record_split() {
        let payload = LogEntryRecord::serialize(7, b"abc");
        let (index, data) = LogEntryRecord::split(&payload).unwrap();
        assert_eq!(index, 7);
        assert_eq!(data, b"abc");
        assert!(LogEntryRecord::split(&payload[..4]).is_none());
    }

    #[test]
    fn test_segment_index_truncate_prefix() {
        let mut index = SegmentIndex::default();
        for i in 5..=9 {
            let r = (i % 2 == 0).then_some((i * 10, i * 10 + 1));
            index.push(meta(i, 1), r);
        }
        assert_eq!(index.ranges.len(), 2);

        index.truncate_prefix(7);
        assert_eq!(index.first_log_index, 7);
        assert_eq!(index.entries.len(), 3);
        assert_eq!(index.get_entry(7).map(|m| m.log_index), Some(7));
        assert!(index.get_entry(6).is_none());
        assert_eq!(index.ranges, vec![range(80, 81, 8)]);

        // No-op below the first index
        index.truncate_prefix(3);
        assert_eq!(index.first_log_index, 7);

        index.truncate_prefix(10);
        assert!(index.is_empty());
        assert!(index.ranges.is_empty());
    }

    #[test]
    fn test_segment_index_truncate_suffix() {
        let mut index = SegmentIndex::default();
        for i in 1..=5 {
            index.push(meta(i, 1), Some((i, i)));
        }
        index.truncate_suffix(3);
        assert_eq!(index.last_log_index, 3);
        assert_eq!(index.entries.len(), 3);
        assert_eq!(index.ranges.len(), 3);
        assert!(!index.is_valid_index(4));

        // Entries appended after a suffix truncation continue at the next index.
        index.push(meta(4, 2), None);
        assert_eq!(index.get_entry(4).map(|m| m.term), Some(2));

        index.truncate_suffix(0);
        assert!(index.is_empty());
    }

    #[test]
    fn test_range_index_find() {
        let mut ranges = RangeIndex::new(1);
        for r in [range(1, 5, 2), range(6, 9, 3), range(10, 10, 5)] {
            ranges.push(r);
        }

        for pos in 1..=5 {
            assert_eq!(ranges.find(pos).map(|r| r.log_index), Some(2));
        }
        assert_eq!(ranges.find(7).map(|r| r.log_index), Some(3));
        assert_eq!(ranges.find(10).map(|r| r.log_index), Some(5));
        assert!(ranges.find(11).is_none());
        assert!(ranges.find(0).is_none());
        assert_eq!(ranges.next_position(), 11);
    }

    #[test]
    fn test_range_index_truncate_and_compact() {
        let mut ranges = RangeIndex::new(1);
        ranges.push(range(1, 5, 1));
        ranges.push(range(6, 9, 2));
        ranges.push(range(10, 12, 4));

        ranges.truncate_after(2);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges.next_position(), 10);

        ranges.compact_before(2);
        assert_eq!(ranges.len(), 1);
        assert!(ranges.find(3).is_none());
        assert_eq!(ranges.next_position(), 10);
    }

    #[test]
    fn test_frame_header_serialization() {
        let header = FrameHeader::new(b"payload", FrameType::TruncateSuffix);
        let bytes = header.serialize();
        let parsed = FrameHeader::deserialize(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.payload_size(), 7);
    }

    #[test]
    fn test_frame_header_invalid() {
        let mut bytes = FrameHeader::new(b"x", FrameType::LogEntry).serialize();
        bytes[8] ^= 0xff;
        assert!(FrameHeader::deserialize(&bytes).is_none());

        let mut bytes = FrameHeader::new(b"x", FrameType::LogEntry).serialize();
        bytes[4] = 9;
        assert!(FrameHeader::deserialize(&bytes).is_none());

        assert!(FrameHeader::deserialize(&bytes[..10]).is_none());
    }
}

#[cfg(test)]
mod segment_tests {
    use std::fs::OpenOptions;
    use std::io::Write;

    use tempfile::TempDir;

    use crate::entry::{self, ApplicationEntry, InitializeEntry, RaftEntry};
    use crate::storage::log::segment::{LogSegment, PreparedEntry};

    fn prepared(log_index: u64, entry: &RaftEntry) -> PreparedEntry {
        PreparedEntry {
            log_index,
            term: entry.term(),
            data: entry::encode(entry).unwrap(),
            range: entry
                .as_application()
                .map(|a| (a.lowest_position, a.highest_position)),
        }
    }

    fn sample_entries() -> Vec<RaftEntry> {
        vec![
            RaftEntry::Initialize(InitializeEntry {
                term: 1,
                timestamp: 10,
            }),
            RaftEntry::Application(ApplicationEntry {
                term: 1,
                lowest_position: 1,
                highest_position: 3,
                data: vec![1, 2, 3],
            }),
            RaftEntry::Application(ApplicationEntry {
                term: 1,
                lowest_position: 4,
                highest_position: 4,
                data: vec![],
            }),
        ]
    }

    fn write_sample(dir: &TempDir) -> LogSegment {
        let mut segment = LogSegment::create(dir.path(), 0).unwrap();
        let entries = sample_entries();
        let prepared: Vec<_> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| prepared(i as u64 + 1, e))
            .collect();
        segment.write_log_entries(&prepared).unwrap();
        segment.sync_data().unwrap();
        segment
    }

    #[test]
    fn test_segment_file_name() {
        assert_eq!(LogSegment::file_name(12), "segment_0000000012.log");
        assert_eq!(LogSegment::parse_file_name("segment_0000000012.log"), Some(12));
        assert_eq!(LogSegment::parse_file_name("segment_x.log"), None);
        assert_eq!(LogSegment::parse_file_name("snapshot.bin"), None);
    }

    #[test]
    fn test_segment_write_and_read() {
        let dir = TempDir::new().unwrap();
        let segment = write_sample(&dir);

        assert_eq!(segment.first_index(), Some(1));
        assert_eq!(segment.last_index(), Some(3));
        assert_eq!(segment.index.ranges.len(), 2);
        assert_eq!(segment.read_entry(2).unwrap(), sample_entries()[1]);
        assert!(segment.read_entry(4).is_err());
    }

    #[test]
    fn test_segment_write_empty_entries() {
        let dir = TempDir::new().unwrap();
        let mut segment = LogSegment::create(dir.path(), 0).unwrap();
        segment.write_log_entries(&[]).unwrap();
        assert!(segment.index.is_empty());
        assert_eq!(segment.size(), 0);
    }

    #[test]
    fn test_segment_replay() {
        let dir = TempDir::new().unwrap();
        let path = {
            let mut segment = write_sample(&dir);
            segment.write_truncate_suffix(2).unwrap();
            segment.sync_data().unwrap();
            segment.file_path.clone()
        };

        let segment = LogSegment::open(path, 0).unwrap();
        assert_eq!(segment.first_index(), Some(1));
        assert_eq!(segment.last_index(), Some(2));
        assert_eq!(segment.index.ranges.len(), 1);
        assert_eq!(segment.read_entry(1).unwrap(), sample_entries()[0]);
    }

    #[test]
    fn test_segment_replay_discards_torn_tail() {
        let dir = TempDir::new().unwrap();
        let (path, good_size) = {
            let segment = write_sample(&dir);
            (segment.file_path.clone(), segment.size())
        };

        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0x10, 0, 0, 0, 1, 0, 0, 0, 0x78]).unwrap();
        }

        let segment = LogSegment::open(path.clone(), 0).unwrap();
        assert_eq!(segment.size(), good_size);
        assert_eq!(segment.last_index(), Some(3));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_size);
    }

    #[test]
    fn test_segment_replay_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = LogSegment::create(dir.path(), 3).unwrap().file_path.clone();
        let segment = LogSegment::open(path, 3).unwrap();
        assert!(segment.index.is_empty());
        assert!(segment.first_index().is_none());
    }
}

#[cfg(test)]
mod store_tests {
    use tempfile::TempDir;

    use crate::entry::{ApplicationEntry, CloseSessionEntry, InitializeEntry, RaftEntry};
    use crate::error::StorageError;
    use crate::storage::log::{SegmentStore, SegmentStoreOptions};

    fn init(term: u64) -> RaftEntry {
        RaftEntry::Initialize(InitializeEntry {
            term,
            timestamp: term * 100,
        })
    }

    fn app(term: u64, lowest: u64, highest: u64) -> RaftEntry {
        RaftEntry::Application(ApplicationEntry {
            term,
            lowest_position: lowest,
            highest_position: highest,
            data: vec![lowest as u8; 100],
        })
    }

    fn open(dir: &TempDir) -> SegmentStore {
        let options = SegmentStoreOptions {
            sync_on_write: false,
            ..SegmentStoreOptions::with_dir(dir.path())
        };
        SegmentStore::open(options).unwrap()
    }

    fn populate(store: &SegmentStore) {
        store.append(&init(1)).unwrap();
        store.append(&app(1, 1, 5)).unwrap();
        store.append(&app(1, 6, 9)).unwrap();
        store.append(&app(1, 10, 10)).unwrap();
    }

    #[test]
    fn test_store_open_empty() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 0);
        assert_eq!(store.last_term(), 0);
        assert_eq!(store.next_record_position(), 1);
        assert_eq!(store.segment_count(), 1);
        assert!(matches!(store.read(1), Err(StorageError::EntryNotFound(1))));
    }

    #[test]
    fn test_store_append_assigns_indices() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert_eq!(store.append(&init(1)).unwrap(), 1);
        assert_eq!(store.append_batch(&[app(1, 1, 2), app(1, 3, 3)], true).unwrap(), 3);
        assert_eq!(store.last_index(), 3);
        assert_eq!(store.last_term(), 1);

        let entries = store.read_range(1, 10).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].index, 3);
        assert_eq!(*entries[2].entry, app(1, 3, 3));
    }

    #[test]
    fn test_store_position_lookup() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        populate(&store);

        let found = store.find_application_entry_containing(7).unwrap().unwrap();
        assert_eq!(found.index, 3);
        assert_eq!(*found.entry, app(1, 6, 9));
        assert!(store.find_application_entry_containing(11).unwrap().is_none());
        assert!(store.find_application_entry_containing(0).unwrap().is_none());
        assert_eq!(store.next_record_position(), 11);
    }

    #[test]
    fn test_store_every_position_maps_to_its_entry() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        populate(&store);

        for range in store.application_ranges() {
            for pos in range.lowest..=range.highest {
                let entry = store.find_application_entry_containing(pos).unwrap().unwrap();
                assert_eq!(entry.index, range.log_index);
                assert!(entry.entry.as_application().unwrap().contains(pos));
            }
        }
        let ranges = store.application_ranges();
        assert!(ranges.windows(2).all(|w| w[0].highest < w[1].lowest));
    }

    #[test]
    fn test_store_rejects_non_monotonic_appends() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        populate(&store);

        // gap, overlap and an empty range
        assert!(matches!(store.append(&app(1, 12, 12)), Err(StorageError::NonMonotonic(_))));
        assert!(matches!(store.append(&app(1, 9, 12)), Err(StorageError::NonMonotonic(_))));
        assert!(matches!(store.append(&app(1, 11, 10)), Err(StorageError::NonMonotonic(_))));
        // second marker in the same term
        assert!(matches!(store.append(&init(1)), Err(StorageError::NonMonotonic(_))));

        store.append(&init(2)).unwrap();
        assert!(matches!(store.append(&app(1, 11, 11)), Err(StorageError::NonMonotonic(_))));
        assert_eq!(store.last_index(), 5);
        assert_eq!(store.last_term(), 2);
    }

    #[test]
    fn test_store_batch_is_all_or_nothing() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.append(&init(1)).unwrap();

        let result = store.append_batch(&[app(1, 1, 1), app(1, 3, 3)], true);
        assert!(result.is_err());
        assert_eq!(store.last_index(), 1);
        assert_eq!(store.next_record_position(), 1);
    }

    #[test]
    fn test_store_capacity_limit() {
        let dir = TempDir::new().unwrap();
        let options = SegmentStoreOptions {
            max_log_bytes: 300,
            sync_on_write: false,
            ..SegmentStoreOptions::with_dir(dir.path())
        };
        let store = SegmentStore::open(options).unwrap();
        store.append(&app(1, 1, 1)).unwrap();
        store.append(&app(1, 2, 2)).unwrap();
        assert!(matches!(store.append(&app(1, 3, 3)), Err(StorageError::Backpressure { .. })));
        assert_eq!(store.last_index(), 2);
    }

    #[test]
    fn test_store_reopen_replays_segments() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            populate(&store);
            store.append(&RaftEntry::CloseSession(CloseSessionEntry {
                term: 1,
                timestamp: 5,
                session_id: 2,
                expired: true,
                delete: false,
            }))
            .unwrap();
            store.sync().unwrap();
        }

        let store = open(&dir);
        assert_eq!(store.last_index(), 5);
        assert_eq!(store.last_term(), 1);
        assert_eq!(store.next_record_position(), 11);
        assert_eq!(store.find_application_entry_containing(10).unwrap().unwrap().index, 4);
        assert_eq!(store.append(&app(1, 11, 11)).unwrap(), 6);
    }

    #[test]
    fn test_store_truncate_suffix() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        populate(&store);

        assert!(matches!(
            store.truncate_suffix(1, 2),
            Err(StorageError::TruncateCommitted {
                after: 1,
                commit_index: 2
            })
        ));

        store.truncate_suffix(2, 2).unwrap();
        assert_eq!(store.last_index(), 2);
        assert_eq!(store.next_record_position(), 6);
        assert!(store.find_application_entry_containing(7).unwrap().is_none());
        assert!(matches!(store.read(3), Err(StorageError::EntryNotFound(3))));

        assert_eq!(store.append(&app(2, 6, 7)).unwrap(), 3);
        drop(store);

        let store = open(&dir);
        assert_eq!(store.last_index(), 3);
        assert_eq!(store.last_term(), 2);
        assert_eq!(*store.read(3).unwrap().entry, app(2, 6, 7));
        assert!(store.find_application_entry_containing(9).unwrap().is_none());
        assert_eq!(store.next_record_position(), 8);
    }

    #[test]
    fn test_store_compaction() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        populate(&store);

        assert!(matches!(
            store.compact(2),
            Err(StorageError::CompactionBeyondSnapshot { .. })
        ));

        store.set_snapshot_index(2);
        store.compact(2).unwrap();
        assert_eq!(store.first_index(), 3);
        assert!(matches!(store.read(1), Err(StorageError::Compacted(1))));
        assert!(store.find_application_entry_containing(3).unwrap().is_none());
        assert_eq!(store.find_application_entry_containing(7).unwrap().unwrap().index, 3);
        drop(store);

        let store = open(&dir);
        assert_eq!(store.first_index(), 3);
        assert_eq!(store.last_index(), 4);
        assert_eq!(store.next_record_position(), 11);
        assert!(store.find_application_entry_containing(2).unwrap().is_none());
    }

    #[test]
    fn test_store_compaction_of_everything_keeps_position() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            populate(&store);
            store.set_snapshot_index(4);
            store.compact(4).unwrap();
            assert_eq!(store.first_index(), 5);
            assert_eq!(store.last_index(), 4);
        }

        let store = open(&dir);
        assert_eq!(store.first_index(), 5);
        assert_eq!(store.last_index(), 4);
        assert_eq!(store.last_term(), 1);
        assert_eq!(store.next_record_position(), 11);
        assert_eq!(store.append(&app(1, 11, 12)).unwrap(), 5);
    }

    #[test]
    fn test_store_rotation_and_segment_cleanup() {
        let dir = TempDir::new().unwrap();
        let options = SegmentStoreOptions {
            max_segment_size: 256,
            sync_on_write: false,
            ..SegmentStoreOptions::with_dir(dir.path())
        };
        let store = SegmentStore::open(options.clone()).unwrap();
        for i in 1..=20 {
            store.append(&app(1, i, i)).unwrap();
        }
        let segments_before = store.segment_count();
        assert!(segments_before > 2);
        for i in 1..=20 {
            assert_eq!(store.find_application_entry_containing(i).unwrap().unwrap().index, i);
        }

        store.set_snapshot_index(15);
        store.compact(15).unwrap();
        assert!(store.segment_count() < segments_before);
        assert_eq!(store.first_index(), 16);
        drop(store);

        let store = SegmentStore::open(options).unwrap();
        assert_eq!(store.first_index(), 16);
        assert_eq!(store.last_index(), 20);
        assert_eq!(*store.read(16).unwrap().entry, app(1, 16, 16));
        assert!(store.find_application_entry_containing(15).unwrap().is_none());
    }
}

#[cfg(test)]
mod writer_tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::entry::{ApplicationEntry, RaftEntry};
    use crate::error::StorageError;
    use crate::storage::log::{LogWriter, LogWriterOptions, SegmentStore, SegmentStoreOptions};

    fn app(lowest: u64, highest: u64) -> RaftEntry {
        RaftEntry::Application(ApplicationEntry {
            term: 1,
            lowest_position: lowest,
            highest_position: highest,
            data: vec![0; 16],
        })
    }

    fn start(dir: &TempDir, options: LogWriterOptions) -> LogWriter {
        let store = SegmentStore::open(SegmentStoreOptions {
            sync_on_write: false,
            ..SegmentStoreOptions::with_dir(dir.path())
        })
        .unwrap();
        LogWriter::start(Arc::new(store), options)
    }

    #[tokio::test]
    async fn test_writer_appends_and_publishes_durable_index() {
        let dir = TempDir::new().unwrap();
        let writer = start(&dir, LogWriterOptions::default());
        let mut durable = writer.subscribe();

        assert_eq!(writer.append(app(1, 2)).await.unwrap(), 1);
        assert_eq!(writer.append(app(3, 3)).await.unwrap(), 2);
        durable.wait_for(|index| *index >= 2).await.unwrap();
        assert_eq!(writer.durable_index(), 2);
        assert_eq!(writer.pending_bytes(), 0);
    }

    #[tokio::test]
    async fn test_writer_bad_entry_fails_alone() {
        let dir = TempDir::new().unwrap();
        let writer = start(&dir, LogWriterOptions::default());

        let (a, b, c) = tokio::join!(
            writer.append(app(1, 1)),
            writer.append(app(5, 5)),
            writer.append(app(2, 2)),
        );
        assert_eq!(a.unwrap(), 1);
        assert!(matches!(b, Err(StorageError::NonMonotonic(_))));
        assert_eq!(c.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_writer_backpressure() {
        let dir = TempDir::new().unwrap();
        let writer = start(
            &dir,
            LogWriterOptions {
                batch_size: 10,
                max_pending_bytes: 1,
            },
        );

        // The second append sees the first one still unacknowledged.
        let (first, second) = tokio::join!(writer.append(app(1, 1)), writer.append(app(2, 2)));
        assert_eq!(first.unwrap(), 1);
        assert!(matches!(second, Err(StorageError::Backpressure { .. })));

        // Capacity is back once the first append is acknowledged.
        assert_eq!(writer.append(app(2, 2)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_writer_truncate_and_close() {
        let dir = TempDir::new().unwrap();
        let writer = start(&dir, LogWriterOptions::default());
        for i in 1..=3 {
            writer.append(app(i, i)).await.unwrap();
        }
        writer.truncate_suffix(1, 1).await.unwrap();
        assert_eq!(writer.durable_index(), 1);
        assert_eq!(writer.store().next_record_position(), 2);

        let mut durable = writer.subscribe();
        writer.close().await.unwrap();
        assert!(matches!(writer.append(app(2, 2)).await, Err(StorageError::Closed)));
        assert!(durable.wait_for(|index| *index > 5).await.is_err());
    }
}
