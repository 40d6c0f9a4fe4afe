use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::StateResult;
use crate::record::JobRecord;
use crate::types::Key;

use super::db::u64_key;
use super::{ColumnFamily, ProcessingState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting for a worker to complete it.
    Activatable,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Job {
    pub key: Key,
    pub record: JobRecord,
    pub state: JobState,
}

impl ProcessingState {
    pub fn job(&self, key: Key) -> StateResult<Option<Job>> {
        self.db.get(ColumnFamily::Jobs, &u64_key(key))
    }

    pub fn put_job(&mut self, job: &Job) -> StateResult<()> {
        self.db.put(ColumnFamily::Jobs, u64_key(job.key), job)
    }

    pub fn remove_job(&mut self, key: Key) {
        self.db.delete(ColumnFamily::Jobs, &u64_key(key));
    }
}
