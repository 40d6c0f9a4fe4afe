use std::collections::BTreeMap;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::StateResult;
use crate::types::Key;

use super::db::{u64_key, u64_str_key};
use super::{ColumnFamily, ProcessingState};

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct StoredVariable {
    pub key: Key,
    /// JSON text of the value.
    pub value: String,
}

// Variables, keyed by (scope, name)
impl ProcessingState {
    pub fn variable(&self, scope_key: Key, name: &str) -> StateResult<Option<StoredVariable>> {
        self.db
            .get(ColumnFamily::Variables, &u64_str_key(scope_key, name))
    }

    pub fn put_variable(
        &mut self,
        scope_key: Key,
        name: &str,
        variable: &StoredVariable,
    ) -> StateResult<()> {
        self.db
            .put(ColumnFamily::Variables, u64_str_key(scope_key, name), variable)
    }

    /// Variables of one scope by name.
    pub fn variables_of(&self, scope_key: Key) -> StateResult<BTreeMap<String, StoredVariable>> {
        let prefix = u64_key(scope_key);
        Ok(self
            .db
            .prefix_values::<StoredVariable>(ColumnFamily::Variables, &prefix)?
            .into_iter()
            .map(|(key, variable)| (String::from_utf8_lossy(&key[8..]).into_owned(), variable))
            .collect())
    }

    pub fn remove_scope_variables(&mut self, scope_key: Key) {
        let prefix = u64_key(scope_key);
        let keys: Vec<Vec<u8>> = self
            .db
            .prefix_scan(ColumnFamily::Variables, &prefix)
            .map(|(key, _)| key.to_vec())
            .collect();
        for key in keys {
            self.db.delete(ColumnFamily::Variables, &key);
        }
    }

    /// Builds a JSON document of the variables of `scope_key`, limited to `names` unless
    /// `names` is empty.
    pub fn variables_document(&self, scope_key: Key, names: &[String]) -> StateResult<Vec<u8>> {
        let mut document = serde_json::Map::new();
        for (name, variable) in self.variables_of(scope_key)? {
            if !names.is_empty() && !names.contains(&name) {
                continue;
            }
            let value = serde_json::from_str(&variable.value).unwrap_or(serde_json::Value::Null);
            document.insert(name, value);
        }
        Ok(serde_json::Value::Object(document).to_string().into_bytes())
    }
}
