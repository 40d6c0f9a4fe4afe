use crate::error::StateResult;
use crate::types::{Key, PartitionId};

use super::{ColumnFamily, ProcessingState};

/// Keys carry their partition in the bits above this shift.
pub const KEY_PARTITION_SHIFT: u32 = 51;

const KEY_COUNTER: &[u8] = b"key_counter";

impl ProcessingState {
    fn key_base(&self) -> Key {
        (self.partition_id as Key) << KEY_PARTITION_SHIFT
    }

    fn key_counter(&self) -> StateResult<u64> {
        Ok(self
            .db
            .get::<u64>(ColumnFamily::Meta, KEY_COUNTER)?
            .unwrap_or(0))
    }

    /// Allocates the next key of this partition; never 0.
    pub fn next_key(&mut self) -> StateResult<Key> {
        let counter = self.key_counter()? + 1;
        self.db.put(ColumnFamily::Meta, KEY_COUNTER.to_vec(), &counter)?;
        Ok(self.key_base() + counter)
    }

    /// Moves the generator past `key` when it was allocated by this partition.
    pub fn set_key_if_higher(&mut self, key: Key) -> StateResult<()> {
        if partition_of(key) != self.partition_id {
            return Ok(());
        }
        let counter = key - self.key_base();
        if counter > self.key_counter()? {
            self.db.put(ColumnFamily::Meta, KEY_COUNTER.to_vec(), &counter)?;
        }
        Ok(())
    }
}

pub fn partition_of(key: Key) -> PartitionId {
    (key >> KEY_PARTITION_SHIFT) as PartitionId
}
