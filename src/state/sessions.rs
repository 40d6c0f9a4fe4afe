use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::entry::{Member, OpenSessionEntry, ReadConsistency};
use crate::error::StateResult;
use crate::types::{SessionId, Timestamp};

use super::db::u64_key;
use super::{ColumnFamily, ProcessingState};

const MEMBERS: &[u8] = b"members";

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub member_id: String,
    pub service_name: String,
    pub service_type: String,
    pub read_consistency: ReadConsistency,
    pub min_timeout: u64,
    pub max_timeout: u64,
    pub last_updated: Timestamp,
    /// Highest command sequence applied for this session.
    pub last_sequence: u64,
    pub acknowledged_sequence: u64,
    pub event_index: u64,
}

impl Session {
    pub fn open(id: SessionId, entry: &OpenSessionEntry) -> Self {
        Self {
            id,
            member_id: entry.member_id.clone(),
            service_name: entry.service_name.clone(),
            service_type: entry.service_type.clone(),
            read_consistency: entry.read_consistency,
            min_timeout: entry.min_timeout,
            max_timeout: entry.max_timeout,
            last_updated: entry.timestamp,
            last_sequence: 0,
            acknowledged_sequence: 0,
            event_index: id,
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now.saturating_sub(self.last_updated) > self.max_timeout
    }
}

// Client sessions and cluster membership
impl ProcessingState {
    pub fn session(&self, id: SessionId) -> StateResult<Option<Session>> {
        self.db.get(ColumnFamily::Sessions, &u64_key(id))
    }

    pub fn put_session(&mut self, session: &Session) -> StateResult<()> {
        self.db
            .put(ColumnFamily::Sessions, u64_key(session.id), session)
    }

    pub fn remove_session(&mut self, id: SessionId) {
        self.db.delete(ColumnFamily::Sessions, &u64_key(id));
    }

    /// Every open session, ordered by id.
    pub fn sessions(&self) -> StateResult<Vec<Session>> {
        Ok(self
            .db
            .prefix_values::<Session>(ColumnFamily::Sessions, &[])?
            .into_iter()
            .map(|(_, session)| session)
            .collect())
    }

    /// Sessions that have not been refreshed within their `max_timeout`.
    pub fn expired_sessions(&self, now: Timestamp) -> StateResult<Vec<SessionId>> {
        Ok(self
            .sessions()?
            .into_iter()
            .filter(|session| session.is_expired(now))
            .map(|session| session.id)
            .collect())
    }

    /// A new term or configuration restarts every session timer at `timestamp`.
    pub fn reset_session_timers(&mut self, timestamp: Timestamp) -> StateResult<()> {
        for mut session in self.sessions()? {
            session.last_updated = timestamp;
            self.put_session(&session)?;
        }
        Ok(())
    }

    pub fn members(&self) -> StateResult<Vec<Member>> {
        Ok(self.db.get(ColumnFamily::Members, MEMBERS)?.unwrap_or_default())
    }

    pub fn set_members(&mut self, members: &[Member]) -> StateResult<()> {
        self.db.put(ColumnFamily::Members, MEMBERS.to_vec(), members)
    }
}
