//! Shared key/value scratch space
//!
//! Last writer wins, no cross-key transactions. Readers must tolerate stale values.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContextEntry {
    pub value: Value,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SharedContext {
    entries: RwLock<HashMap<String, ContextEntry>>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<K: Into<String>>(&self, key: K, value: Value, writer: &str) {
        let key = key.into();
        debug!(key = %key, writer, "Shared context updated");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key,
                ContextEntry {
                    value,
                    updated_by: writer.to_string(),
                    updated_at: Utc::now(),
                },
            );
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entry(key).map(|entry| entry.value)
    }

    pub fn entry(&self, key: &str) -> Option<ContextEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn remove(&self, key: &str) -> Option<ContextEntry> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn snapshot(&self) -> BTreeMap<String, ContextEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
