//! Log entry model.
//!
//! Every entry appended to a partition's log is one [`RaftEntry`] variant. Entries are
//! immutable once built; the segment store owns their encoded bytes and hands out
//! decoded views as [`IndexedEntry`].

pub mod codec;

use std::{fmt, sync::Arc};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::types::{LogIndex, RecordPosition, SessionId, Term, Timestamp};

pub use codec::{
    CURRENT_SCHEMA_VERSION, ENTRY_HEADER_SIZE, EntryHeader, decode, encode,
    peek_application_range, peek_term, read_header,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub enum MemberType {
    Active,
    Passive,
    Promotable,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub member_type: MemberType,
    pub address: String,
    pub updated: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub enum ReadConsistency {
    Sequential,
    LinearizableLease,
    Linearizable,
}

/// First entry a new leader commits in its term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct InitialEntry {
    pub term: Term,
}

/// Start of a leader's term; session timers are reset to `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct InitializeEntry {
    pub term: Term,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct ConfigurationEntry {
    pub term: Term,
    pub timestamp: Timestamp,
    pub members: Vec<Member>,
}

/// Session registration. The session id is the log index of this entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct OpenSessionEntry {
    pub term: Term,
    pub timestamp: Timestamp,
    pub member_id: String,
    pub service_name: String,
    pub service_type: String,
    pub service_config: Vec<u8>,
    pub read_consistency: ReadConsistency,
    pub min_timeout: u64,
    pub max_timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct CloseSessionEntry {
    pub term: Term,
    pub timestamp: Timestamp,
    pub session_id: SessionId,
    /// Closed because the session timed out rather than on client request.
    pub expired: bool,
    /// Also drop state owned by the session.
    pub delete: bool,
}

/// Heartbeat batch; the three vectors are parallel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct KeepAliveEntry {
    pub term: Term,
    pub timestamp: Timestamp,
    pub session_ids: Vec<SessionId>,
    pub command_sequences: Vec<u64>,
    pub event_indexes: Vec<u64>,
}

/// Shared shape of commands and queries submitted through a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct OperationEntry {
    pub term: Term,
    pub timestamp: Timestamp,
    pub session_id: SessionId,
    pub sequence: u64,
    pub operation: Vec<u8>,
}

/// A batch of application records covering `lowest_position..=highest_position`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct ApplicationEntry {
    pub term: Term,
    pub lowest_position: RecordPosition,
    pub highest_position: RecordPosition,
    pub data: Vec<u8>,
}

impl ApplicationEntry {
    pub fn contains(&self, position: RecordPosition) -> bool {
        position >= self.lowest_position && position <= self.highest_position
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RaftEntry {
    Initial(InitialEntry),
    Initialize(InitializeEntry),
    Configuration(ConfigurationEntry),
    OpenSession(OpenSessionEntry),
    CloseSession(CloseSessionEntry),
    KeepAlive(KeepAliveEntry),
    Command(OperationEntry),
    Query(OperationEntry),
    Application(ApplicationEntry),
}

/// Stable wire discriminant of each entry variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum EntryKind {
    Initial = 1,
    Initialize = 2,
    Configuration = 3,
    OpenSession = 4,
    CloseSession = 5,
    KeepAlive = 6,
    Command = 7,
    Query = 8,
    Application = 9,
}

impl EntryKind {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(EntryKind::Initial),
            2 => Some(EntryKind::Initialize),
            3 => Some(EntryKind::Configuration),
            4 => Some(EntryKind::OpenSession),
            5 => Some(EntryKind::CloseSession),
            6 => Some(EntryKind::KeepAlive),
            7 => Some(EntryKind::Command),
            8 => Some(EntryKind::Query),
            9 => Some(EntryKind::Application),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl RaftEntry {
    pub fn kind(&self) -> EntryKind {
        match self {
            RaftEntry::Initial(_) => EntryKind::Initial,
            RaftEntry::Initialize(_) => EntryKind::Initialize,
            RaftEntry::Configuration(_) => EntryKind::Configuration,
            RaftEntry::OpenSession(_) => EntryKind::OpenSession,
            RaftEntry::CloseSession(_) => EntryKind::CloseSession,
            RaftEntry::KeepAlive(_) => EntryKind::KeepAlive,
            RaftEntry::Command(_) => EntryKind::Command,
            RaftEntry::Query(_) => EntryKind::Query,
            RaftEntry::Application(_) => EntryKind::Application,
        }
    }

    pub fn term(&self) -> Term {
        match self {
            RaftEntry::Initial(e) => e.term,
            RaftEntry::Initialize(e) => e.term,
            RaftEntry::Configuration(e) => e.term,
            RaftEntry::OpenSession(e) => e.term,
            RaftEntry::CloseSession(e) => e.term,
            RaftEntry::KeepAlive(e) => e.term,
            RaftEntry::Command(e) | RaftEntry::Query(e) => e.term,
            RaftEntry::Application(e) => e.term,
        }
    }

    /// Leader wall clock at append time, `None` for variants that carry none.
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            RaftEntry::Initial(_) | RaftEntry::Application(_) => None,
            RaftEntry::Initialize(e) => Some(e.timestamp),
            RaftEntry::Configuration(e) => Some(e.timestamp),
            RaftEntry::OpenSession(e) => Some(e.timestamp),
            RaftEntry::CloseSession(e) => Some(e.timestamp),
            RaftEntry::KeepAlive(e) => Some(e.timestamp),
            RaftEntry::Command(e) | RaftEntry::Query(e) => Some(e.timestamp),
        }
    }

    /// Initial and Initialize entries open a term.
    pub fn is_term_start(&self) -> bool {
        matches!(self, RaftEntry::Initial(_) | RaftEntry::Initialize(_))
    }

    pub fn as_application(&self) -> Option<&ApplicationEntry> {
        match self {
            RaftEntry::Application(e) => Some(e),
            _ => None,
        }
    }
}

/// A decoded entry together with the log index it was stored at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEntry {
    pub index: LogIndex,
    pub entry: Arc<RaftEntry>,
}

impl IndexedEntry {
    pub fn new(index: LogIndex, entry: RaftEntry) -> Self {
        Self {
            index,
            entry: Arc::new(entry),
        }
    }

    pub fn term(&self) -> Term {
        self.entry.term()
    }
}
