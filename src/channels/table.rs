//! Store key naming for a logical table, and read access to its visible records.

use std::sync::Arc;

use crate::constants::keys::{
    CHANNEL_SUFFIX, DELETE_SET_SUFFIX, KEYSPACE_PREFIX, PENDING_SET_SUFFIX, QUEUE_SUFFIX,
    STAGING_PREFIX,
};
use crate::constants::DEFAULT_TABLE_SEPARATOR;
use crate::error::OrchBusResult;
use crate::store::{CoalescingLayout, FieldValues, SharedStore};

/// A logical table and the store keys derived from its name
///
/// For `PORT_TABLE` with separator `:`:
///
/// | Purpose | Key |
/// |---|---|
/// | visible record | `PORT_TABLE:Ethernet0` |
/// | staging record | `_PORT_TABLE:Ethernet0` |
/// | pending keys | `PORT_TABLE_KEY_SET` |
/// | delete markers | `PORT_TABLE_DEL_SET` |
/// | wake-up channel | `PORT_TABLE_CHANNEL` |
/// | ordered queue | `PORT_TABLE_KEY_VALUE_OP_QUEUE` |
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    name: String,
    separator: char,
}

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_separator(name, DEFAULT_TABLE_SEPARATOR)
    }

    pub fn with_separator(name: impl Into<String>, separator: char) -> Self {
        Self {
            name: name.into(),
            separator,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn record_prefix(&self) -> String {
        format!("{}{}", self.name, self.separator)
    }

    pub fn record_key(&self, key: &str) -> String {
        format!("{}{}", self.record_prefix(), key)
    }

    pub fn staging_key(&self, key: &str) -> String {
        format!("{STAGING_PREFIX}{}", self.record_key(key))
    }

    pub fn pending_set(&self) -> String {
        format!("{}{PENDING_SET_SUFFIX}", self.name)
    }

    pub fn delete_set(&self) -> String {
        format!("{}{DELETE_SET_SUFFIX}", self.name)
    }

    pub fn channel(&self) -> String {
        format!("{}{CHANNEL_SUFFIX}", self.name)
    }

    pub fn queue(&self) -> String {
        format!("{}{QUEUE_SUFFIX}", self.name)
    }

    /// Prefix of keyspace notification channels for this table's records
    pub fn keyspace_prefix(&self) -> String {
        format!("{KEYSPACE_PREFIX}{}", self.record_prefix())
    }

    pub fn keyspace_pattern(&self) -> String {
        format!("{}*", self.keyspace_prefix())
    }

    /// Record key back to the table-relative key
    pub fn strip_record_prefix<'a>(&self, record_key: &'a str) -> Option<&'a str> {
        record_key
            .strip_prefix(self.name.as_str())
            .and_then(|rest| rest.strip_prefix(self.separator))
    }

    pub fn coalescing_layout(&self) -> CoalescingLayout {
        CoalescingLayout {
            pending_set: self.pending_set(),
            delete_set: self.delete_set(),
            staging_prefix: format!("{STAGING_PREFIX}{}", self.record_prefix()),
            record_prefix: self.record_prefix(),
            channel: self.channel(),
        }
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Read access to the visible records of a table
#[derive(Debug, Clone)]
pub struct TableReader {
    store: Arc<dyn SharedStore>,
    table: TableName,
}

impl TableReader {
    pub fn new(store: Arc<dyn SharedStore>, table: TableName) -> Self {
        Self { store, table }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// All fields of a record; `None` when the record does not exist
    pub async fn get(&self, key: &str) -> OrchBusResult<Option<FieldValues>> {
        let fields = self.store.hash_get_all(&self.table.record_key(key)).await?;
        Ok((!fields.is_empty()).then_some(fields))
    }

    pub async fn get_field(&self, key: &str, field: &str) -> OrchBusResult<Option<String>> {
        Ok(self.get(key).await?.and_then(|fields| {
            fields
                .into_iter()
                .find(|(f, _)| f == field)
                .map(|(_, v)| v)
        }))
    }

    /// Table-relative keys of every visible record, sorted
    pub async fn keys(&self) -> OrchBusResult<Vec<String>> {
        let pattern = format!("{}*", self.table.record_prefix());
        let keys = self.store.keys(&pattern).await?;
        Ok(keys
            .iter()
            .filter_map(|k| self.table.strip_record_prefix(k))
            .map(str::to_string)
            .collect())
    }
}
