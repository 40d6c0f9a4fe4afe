//! Ordered in-memory tables with an undo log.
//!
//! Keys are big-endian encoded so byte order equals numeric order and prefix scans
//! iterate in key order. Values are bincode.

use std::collections::BTreeMap;

use bincode::{Decode, Encode};
use tracing::debug;

use crate::error::{StateError, StateResult};

const SNAPSHOT_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub enum ColumnFamily {
    Meta,
    Processes,
    ProcessVersions,
    LatestProcess,
    ElementInstances,
    ElementChildren,
    Variables,
    Jobs,
    PendingRequests,
    Sessions,
    Members,
}

impl ColumnFamily {
    pub fn name(self) -> &'static str {
        match self {
            ColumnFamily::Meta => "meta",
            ColumnFamily::Processes => "processes",
            ColumnFamily::ProcessVersions => "process_versions",
            ColumnFamily::LatestProcess => "latest_process",
            ColumnFamily::ElementInstances => "element_instances",
            ColumnFamily::ElementChildren => "element_children",
            ColumnFamily::Variables => "variables",
            ColumnFamily::Jobs => "jobs",
            ColumnFamily::PendingRequests => "pending_requests",
            ColumnFamily::Sessions => "sessions",
            ColumnFamily::Members => "members",
        }
    }
}

#[derive(Debug, Clone)]
struct UndoEntry {
    cf: ColumnFamily,
    key: Vec<u8>,
    previous: Option<Vec<u8>>,
}

#[derive(Encode, Decode)]
struct StateSnapshot {
    version: u16,
    tables: Vec<(ColumnFamily, Vec<(Vec<u8>, Vec<u8>)>)>,
}

/// Per-partition key/value tables. Single writer, no internal locking.
#[derive(Debug, Default)]
pub struct StateDb {
    tables: BTreeMap<ColumnFamily, BTreeMap<Vec<u8>, Vec<u8>>>,
    undo: Option<Vec<UndoEntry>>,
}

impl StateDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_raw(&self, cf: ColumnFamily, key: &[u8]) -> Option<&[u8]> {
        self.tables
            .get(&cf)
            .and_then(|table| table.get(key))
            .map(Vec::as_slice)
    }

    pub fn put_raw(&mut self, cf: ColumnFamily, key: Vec<u8>, value: Vec<u8>) {
        let table = self.tables.entry(cf).or_default();
        let previous = table.insert(key.clone(), value);
        if let Some(undo) = &mut self.undo {
            undo.push(UndoEntry { cf, key, previous });
        }
    }

    pub fn delete(&mut self, cf: ColumnFamily, key: &[u8]) {
        let Some(table) = self.tables.get_mut(&cf) else {
            return;
        };
        let previous = table.remove(key);
        if previous.is_none() {
            return;
        }
        if table.is_empty() {
            self.tables.remove(&cf);
        }
        if let Some(undo) = &mut self.undo {
            undo.push(UndoEntry {
                cf,
                key: key.to_vec(),
                previous,
            });
        }
    }

    pub fn get<V: Decode<()>>(&self, cf: ColumnFamily, key: &[u8]) -> StateResult<Option<V>> {
        self.get_raw(cf, key)
            .map(|bytes| decode_value(cf, bytes))
            .transpose()
    }

    pub fn put<V: Encode + ?Sized>(
        &mut self,
        cf: ColumnFamily,
        key: Vec<u8>,
        value: &V,
    ) -> StateResult<()> {
        let bytes = bincode::encode_to_vec(value, bincode::config::standard()).map_err(|e| {
            StateError::Encode {
                cf: cf.name(),
                reason: e.to_string(),
            }
        })?;
        self.put_raw(cf, key, bytes);
        Ok(())
    }

    /// Entries whose key starts with `prefix`, in key order.
    pub fn prefix_scan<'a>(
        &'a self,
        cf: ColumnFamily,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + 'a {
        self.tables
            .get(&cf)
            .into_iter()
            .flat_map(move |table| table.range(prefix.to_vec()..))
            .take_while(move |(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.as_slice(), value.as_slice()))
    }

    /// Decoded values of a prefix scan.
    pub fn prefix_values<V: Decode<()>>(
        &self,
        cf: ColumnFamily,
        prefix: &[u8],
    ) -> StateResult<Vec<(Vec<u8>, V)>> {
        self.prefix_scan(cf, prefix)
            .map(|(key, bytes)| Ok((key.to_vec(), decode_value(cf, bytes)?)))
            .collect()
    }

    /// Starts recording undo information. Nested transactions are not supported.
    pub fn begin(&mut self) {
        debug_assert!(!self.in_transaction(), "transaction already open");
        self.undo = Some(Vec::new());
    }

    pub fn in_transaction(&self) -> bool {
        self.undo.is_some()
    }

    pub fn commit(&mut self) {
        self.undo = None;
    }

    /// Restores every key touched since `begin`, newest change first.
    pub fn rollback(&mut self) {
        let Some(undo) = self.undo.take() else {
            return;
        };
        let changes = undo.len();
        for entry in undo.into_iter().rev() {
            let table = self.tables.entry(entry.cf).or_default();
            match entry.previous {
                Some(previous) => {
                    table.insert(entry.key, previous);
                }
                None => {
                    table.remove(&entry.key);
                }
            }
            if table.is_empty() {
                self.tables.remove(&entry.cf);
            }
        }
        debug!("Rolled back {} state changes", changes);
    }

    /// Deterministic encoding of every table.
    pub fn export(&self) -> StateResult<Vec<u8>> {
        let snapshot = StateSnapshot {
            version: SNAPSHOT_VERSION,
            tables: self
                .tables
                .iter()
                .map(|(cf, table)| {
                    let rows = table.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    (*cf, rows)
                })
                .collect(),
        };
        bincode::encode_to_vec(&snapshot, bincode::config::standard())
            .map_err(|e| StateError::InvalidSnapshot(e.to_string()))
    }

    /// Replaces all tables with the content of an exported blob.
    pub fn import(&mut self, data: &[u8]) -> StateResult<()> {
        let (snapshot, read): (StateSnapshot, usize) =
            bincode::decode_from_slice(data, bincode::config::standard())
                .map_err(|e| StateError::InvalidSnapshot(e.to_string()))?;
        if read != data.len() {
            return Err(StateError::InvalidSnapshot(format!(
                "{} trailing bytes",
                data.len() - read
            )));
        }
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StateError::InvalidSnapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        self.tables = snapshot
            .tables
            .into_iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(cf, rows)| (cf, rows.into_iter().collect()))
            .collect();
        self.undo = None;
        Ok(())
    }
}

fn decode_value<V: Decode<()>>(cf: ColumnFamily, bytes: &[u8]) -> StateResult<V> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StateError::Decode {
            cf: cf.name(),
            reason: e.to_string(),
        })
}

pub(crate) fn u64_key(key: u64) -> Vec<u8> {
    key.to_be_bytes().to_vec()
}

pub(crate) fn pair_key(first: u64, second: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&first.to_be_bytes());
    buf.extend_from_slice(&second.to_be_bytes());
    buf
}

pub(crate) fn u64_str_key(first: u64, name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + name.len());
    buf.extend_from_slice(&first.to_be_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf
}

/// `id` terminated by a zero byte, so one id is never a prefix of another.
pub(crate) fn str_prefix(id: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(id.len() + 1);
    buf.extend_from_slice(id.as_bytes());
    buf.push(0);
    buf
}

pub(crate) fn str_u32_key(id: &str, version: u32) -> Vec<u8> {
    let mut buf = str_prefix(id);
    buf.extend_from_slice(&version.to_be_bytes());
    buf
}
