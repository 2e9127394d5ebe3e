use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;

use crate::content::{ContentKey, ProvisionalRecord};

/// Tab-scoped key/value storage for provisional records.
pub trait ProvisionalStore: Send + Sync {
    fn get(&self, key: ContentKey) -> Option<ProvisionalRecord>;
    fn set(&self, record: &ProvisionalRecord) -> Result<()>;
    fn delete(&self, key: ContentKey) -> bool;
}

#[derive(Debug, Clone)]
pub struct Options {
    pub ttl: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Records are kept serialized, the same way a browser session store holds
/// strings, so a corrupt or outdated entry reads as missing.
#[derive(Debug, Default)]
pub struct MemoryProvisionalStore {
    entries: Mutex<HashMap<String, String>>,
    opts: Options,
}

impl MemoryProvisionalStore {
    pub fn new(opts: Options) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            opts,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn set_raw(&self, key: ContentKey, raw: impl Into<String>) {
        self.entries.lock().insert(key.storage_key(), raw.into());
    }

    fn is_expired(&self, record: &ProvisionalRecord) -> bool {
        if self.opts.ttl.is_zero() {
            return false;
        }
        let age = Utc::now().signed_duration_since(record.stored_at);
        match age.to_std() {
            Ok(age) => age > self.opts.ttl,
            Err(_) => false,
        }
    }
}

impl ProvisionalStore for MemoryProvisionalStore {
    fn get(&self, key: ContentKey) -> Option<ProvisionalRecord> {
        let storage_key = key.storage_key();
        let mut entries = self.entries.lock();
        let raw = entries.get(&storage_key)?;
        let record = match serde_json::from_str::<ProvisionalRecord>(raw) {
            Ok(record) if record.key() == key => record,
            Ok(_) | Err(_) => {
                tracing::debug!(%key, "dropping unreadable provisional record");
                entries.remove(&storage_key);
                return None;
            }
        };
        if self.is_expired(&record) {
            tracing::debug!(%key, "provisional record expired");
            entries.remove(&storage_key);
            return None;
        }
        Some(record)
    }

    fn set(&self, record: &ProvisionalRecord) -> Result<()> {
        let raw = serde_json::to_string(record)
            .with_context(|| format!("storage: serialize provisional {}", record.key()))?;
        self.entries.lock().insert(record.key().storage_key(), raw);
        Ok(())
    }

    fn delete(&self, key: ContentKey) -> bool {
        self.entries.lock().remove(&key.storage_key()).is_some()
    }
}
