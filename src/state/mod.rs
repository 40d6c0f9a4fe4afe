//! Per-partition state.
//!
//! [`StateDb`] holds the raw tables; [`ProcessingState`] layers typed access on top of
//! it, one file per entity. All mutation happens on the partition task, so nothing here
//! is synchronized.

mod db;
mod element_instances;
mod jobs;
mod keys;
mod meta;
mod pending;
mod processes;
mod sessions;
mod variables;

use crate::error::StateResult;
use crate::types::PartitionId;

pub use db::{ColumnFamily, StateDb};
pub use element_instances::{ElementInstance, ElementState};
pub use jobs::{Job, JobState};
pub use keys::KEY_PARTITION_SHIFT;
pub use sessions::Session;
pub use variables::StoredVariable;

pub struct ProcessingState {
    partition_id: PartitionId,
    db: StateDb,
}

impl ProcessingState {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            db: StateDb::new(),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn db(&self) -> &StateDb {
        &self.db
    }

    pub fn begin(&mut self) {
        self.db.begin();
    }

    pub fn commit(&mut self) {
        self.db.commit();
    }

    pub fn rollback(&mut self) {
        self.db.rollback();
    }

    pub fn export(&self) -> StateResult<Vec<u8>> {
        self.db.export()
    }

    pub fn import(&mut self, data: &[u8]) -> StateResult<()> {
        self.db.import(data)
    }
}
