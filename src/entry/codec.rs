//! Schema-versioned entry codec.
//!
//! Wire layout of one encoded entry:
//!
//! ```text
//! | kind: u16 LE | schema version: u16 LE | body length: u32 LE | body (bincode) |
//! ```
//!
//! Decoding never guesses: an unknown kind, a version this build does not understand,
//! a short buffer or trailing bytes all fail with [`SchemaError`].

use bincode::{Decode, Encode};

use crate::error::SchemaError;
use crate::types::{RecordPosition, Term};

use super::{
    ApplicationEntry, CloseSessionEntry, ConfigurationEntry, EntryKind, InitialEntry,
    InitializeEntry, KeepAliveEntry, OpenSessionEntry, OperationEntry, RaftEntry,
};

pub const ENTRY_HEADER_SIZE: usize = 8; // 2 + 2 + 4
pub const CURRENT_SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub kind: EntryKind,
    pub version: u16,
    pub length: u32,
}

impl EntryHeader {
    pub fn serialize(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.kind.code().to_le_bytes());
        buf[2..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf
    }
}

/// Highest schema version this build can decode for `kind`. Older versions down to 1
/// stay readable when a kind's layout evolves.
pub fn supported_version(kind: EntryKind) -> u16 {
    match kind {
        EntryKind::Initial
        | EntryKind::Initialize
        | EntryKind::Configuration
        | EntryKind::OpenSession
        | EntryKind::CloseSession
        | EntryKind::KeepAlive
        | EntryKind::Command
        | EntryKind::Query
        | EntryKind::Application => CURRENT_SCHEMA_VERSION,
    }
}

/// Leading fields of an application body, decoded without touching the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Decode)]
struct ApplicationHead {
    _term: Term,
    lowest_position: RecordPosition,
    highest_position: RecordPosition,
}

/// Every body starts with the term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Decode)]
struct TermHead {
    term: Term,
}

fn encode_body<T: Encode>(body: &T) -> Result<Vec<u8>, SchemaError> {
    bincode::encode_to_vec(body, bincode::config::standard())
        .map_err(|e| SchemaError::Body(e.to_string()))
}

fn decode_body<T: Decode<()>>(body: &[u8]) -> Result<T, SchemaError> {
    let (value, read) = bincode::decode_from_slice::<T, _>(body, bincode::config::standard())
        .map_err(|e| SchemaError::Body(e.to_string()))?;
    if read != body.len() {
        return Err(SchemaError::LengthMismatch {
            declared: body.len(),
            actual: read,
        });
    }
    Ok(value)
}

pub fn encode(entry: &RaftEntry) -> Result<Vec<u8>, SchemaError> {
    let body = match entry {
        RaftEntry::Initial(e) => encode_body(e)?,
        RaftEntry::Initialize(e) => encode_body(e)?,
        RaftEntry::Configuration(e) => encode_body(e)?,
        RaftEntry::OpenSession(e) => encode_body(e)?,
        RaftEntry::CloseSession(e) => encode_body(e)?,
        RaftEntry::KeepAlive(e) => encode_body(e)?,
        RaftEntry::Command(e) | RaftEntry::Query(e) => encode_body(e)?,
        RaftEntry::Application(e) => encode_body(e)?,
    };
    let length = u32::try_from(body.len())
        .map_err(|_| SchemaError::Body(format!("body of {} bytes too large", body.len())))?;
    let header = EntryHeader {
        kind: entry.kind(),
        version: CURRENT_SCHEMA_VERSION,
        length,
    };

    let mut buf = Vec::with_capacity(ENTRY_HEADER_SIZE + body.len());
    buf.extend_from_slice(&header.serialize());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Parses and validates the fixed header, including the version negotiation.
pub fn read_header(bytes: &[u8]) -> Result<EntryHeader, SchemaError> {
    if bytes.len() < ENTRY_HEADER_SIZE {
        return Err(SchemaError::Truncated {
            needed: ENTRY_HEADER_SIZE,
            available: bytes.len(),
        });
    }
    let code = u16::from_le_bytes([bytes[0], bytes[1]]);
    let version = u16::from_le_bytes([bytes[2], bytes[3]]);
    let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    let kind = EntryKind::from_code(code).ok_or(SchemaError::UnknownKind(code))?;
    if version == 0 || version > supported_version(kind) {
        return Err(SchemaError::UnsupportedVersion {
            kind: code,
            version,
        });
    }
    Ok(EntryHeader {
        kind,
        version,
        length,
    })
}

fn body_of<'a>(bytes: &'a [u8], header: &EntryHeader) -> Result<&'a [u8], SchemaError> {
    let declared = header.length as usize;
    let available = bytes.len() - ENTRY_HEADER_SIZE;
    if available < declared {
        return Err(SchemaError::Truncated {
            needed: ENTRY_HEADER_SIZE + declared,
            available: bytes.len(),
        });
    }
    if available > declared {
        return Err(SchemaError::LengthMismatch {
            declared,
            actual: available,
        });
    }
    Ok(&bytes[ENTRY_HEADER_SIZE..])
}

pub fn decode(bytes: &[u8]) -> Result<RaftEntry, SchemaError> {
    let header = read_header(bytes)?;
    let body = body_of(bytes, &header)?;

    let entry = match header.kind {
        EntryKind::Initial => RaftEntry::Initial(decode_body::<InitialEntry>(body)?),
        EntryKind::Initialize => RaftEntry::Initialize(decode_body::<InitializeEntry>(body)?),
        EntryKind::Configuration => {
            RaftEntry::Configuration(decode_body::<ConfigurationEntry>(body)?)
        }
        EntryKind::OpenSession => RaftEntry::OpenSession(decode_body::<OpenSessionEntry>(body)?),
        EntryKind::CloseSession => {
            RaftEntry::CloseSession(decode_body::<CloseSessionEntry>(body)?)
        }
        EntryKind::KeepAlive => RaftEntry::KeepAlive(decode_body::<KeepAliveEntry>(body)?),
        EntryKind::Command => RaftEntry::Command(decode_body::<OperationEntry>(body)?),
        EntryKind::Query => RaftEntry::Query(decode_body::<OperationEntry>(body)?),
        EntryKind::Application => {
            RaftEntry::Application(decode_body::<ApplicationEntry>(body)?)
        }
    };
    Ok(entry)
}

/// Returns the `(lowest, highest)` record positions of an encoded application entry
/// without decoding its payload, or `None` for any other kind.
pub fn peek_application_range(
    bytes: &[u8],
) -> Result<Option<(RecordPosition, RecordPosition)>, SchemaError> {
    let header = read_header(bytes)?;
    if header.kind != EntryKind::Application {
        return Ok(None);
    }
    let body = body_of(bytes, &header)?;
    let (head, _) =
        bincode::decode_from_slice::<ApplicationHead, _>(body, bincode::config::standard())
            .map_err(|e| SchemaError::Body(e.to_string()))?;
    Ok(Some((head.lowest_position, head.highest_position)))
}

/// Reads the term of an encoded entry without decoding the rest of the body.
pub fn peek_term(bytes: &[u8]) -> Result<Term, SchemaError> {
    let header = read_header(bytes)?;
    let body = body_of(bytes, &header)?;
    let (head, _) = bincode::decode_from_slice::<TermHead, _>(body, bincode::config::standard())
        .map_err(|e| SchemaError::Body(e.to_string()))?;
    Ok(head.term)
}
