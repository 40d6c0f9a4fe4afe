use crate::error::StateResult;
use crate::record::ProcessRecord;
use crate::types::Key;

use super::db::{str_prefix, str_u32_key, u64_key};
use super::{ColumnFamily, ProcessingState};

// Deployed processes
impl ProcessingState {
    pub fn put_process(&mut self, process: &ProcessRecord) -> StateResult<()> {
        self.db
            .put(ColumnFamily::Processes, u64_key(process.key), process)?;
        self.db.put(
            ColumnFamily::ProcessVersions,
            str_u32_key(&process.bpmn_process_id, process.version),
            &process.key,
        )?;
        if process.version > self.latest_version(&process.bpmn_process_id)? {
            self.db.put(
                ColumnFamily::LatestProcess,
                str_prefix(&process.bpmn_process_id),
                &process.version,
            )?;
        }
        Ok(())
    }

    pub fn process_by_key(&self, key: Key) -> StateResult<Option<ProcessRecord>> {
        self.db.get(ColumnFamily::Processes, &u64_key(key))
    }

    pub fn process_by_id_and_version(
        &self,
        bpmn_process_id: &str,
        version: u32,
    ) -> StateResult<Option<ProcessRecord>> {
        let key: Option<Key> = self.db.get(
            ColumnFamily::ProcessVersions,
            &str_u32_key(bpmn_process_id, version),
        )?;
        match key {
            Some(key) => self.process_by_key(key),
            None => Ok(None),
        }
    }

    /// 0 when no version of `bpmn_process_id` is deployed.
    pub fn latest_version(&self, bpmn_process_id: &str) -> StateResult<u32> {
        Ok(self
            .db
            .get(ColumnFamily::LatestProcess, &str_prefix(bpmn_process_id))?
            .unwrap_or(0))
    }

    pub fn latest_process(&self, bpmn_process_id: &str) -> StateResult<Option<ProcessRecord>> {
        match self.latest_version(bpmn_process_id)? {
            0 => Ok(None),
            version => self.process_by_id_and_version(bpmn_process_id, version),
        }
    }

    /// All deployed versions of `bpmn_process_id`, oldest first.
    pub fn process_versions(&self, bpmn_process_id: &str) -> StateResult<Vec<ProcessRecord>> {
        let prefix = str_prefix(bpmn_process_id);
        let keys = self
            .db
            .prefix_values::<Key>(ColumnFamily::ProcessVersions, &prefix)?;
        let mut processes = Vec::with_capacity(keys.len());
        for (_, key) in keys {
            if let Some(process) = self.process_by_key(key)? {
                processes.push(process);
            }
        }
        Ok(processes)
    }
}
