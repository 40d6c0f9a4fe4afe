use crate::error::StateResult;
use crate::record::AwaitResult;
use crate::types::Key;

use super::db::u64_key;
use super::{ColumnFamily, ProcessingState};

// Await-result metadata, keyed by process instance
impl ProcessingState {
    pub fn pending_request(&self, process_instance_key: Key) -> StateResult<Option<AwaitResult>> {
        self.db
            .get(ColumnFamily::PendingRequests, &u64_key(process_instance_key))
    }

    pub fn put_pending_request(
        &mut self,
        process_instance_key: Key,
        pending: &AwaitResult,
    ) -> StateResult<()> {
        self.db.put(
            ColumnFamily::PendingRequests,
            u64_key(process_instance_key),
            pending,
        )
    }

    pub fn remove_pending_request(&mut self, process_instance_key: Key) {
        self.db
            .delete(ColumnFamily::PendingRequests, &u64_key(process_instance_key));
    }

    /// Drops every pending request answered on `stream_id`; returns how many were removed.
    pub fn remove_pending_requests_of_stream(&mut self, stream_id: u64) -> StateResult<usize> {
        let owned: Vec<Vec<u8>> = self
            .db
            .prefix_values::<AwaitResult>(ColumnFamily::PendingRequests, &[])?
            .into_iter()
            .filter(|(_, pending)| pending.request.stream_id == stream_id)
            .map(|(key, _)| key)
            .collect();
        for key in &owned {
            self.db.delete(ColumnFamily::PendingRequests, key);
        }
        Ok(owned.len())
    }
}
