//! Collection store: schema-less JSON records in LMDB
//!
//! Records live in one database keyed `collection/id`. Every committed
//! change publishes a fresh snapshot of its collection to subscribers.

use heed::types::{Bytes, Str};
use heed::{Database, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::error::{PortalError, Result};

/// A stored record: a JSON object that always carries a string `id`
pub type Record = serde_json::Map<String, Value>;

/// Status values that drive visibility and workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Draft,
    Published,
    Archived,
    Open,
    Closed,
    Pending,
    Paid,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Draft => "draft",
            RecordStatus::Published => "published",
            RecordStatus::Archived => "archived",
            RecordStatus::Open => "open",
            RecordStatus::Closed => "closed",
            RecordStatus::Pending => "pending",
            RecordStatus::Paid => "paid",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(RecordStatus::Draft),
            "published" => Some(RecordStatus::Published),
            "archived" => Some(RecordStatus::Archived),
            "open" => Some(RecordStatus::Open),
            "closed" => Some(RecordStatus::Closed),
            "pending" => Some(RecordStatus::Pending),
            "paid" => Some(RecordStatus::Paid),
            "failed" => Some(RecordStatus::Failed),
            _ => None,
        }
    }

    /// Status of a record, if it carries a recognised one
    pub fn of(record: &Record) -> Option<Self> {
        record
            .get("status")
            .and_then(|s| s.as_str())
            .and_then(Self::parse)
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publicly visible: published, or no status field at all
pub fn is_visible(record: &Record) -> bool {
    match record.get("status") {
        None | Some(Value::Null) => true,
        Some(_) => RecordStatus::of(record) == Some(RecordStatus::Published),
    }
}

pub fn record_id(record: &Record) -> Option<&str> {
    record.get("id").and_then(|id| id.as_str())
}

/// Generate a random record id
pub fn generate_record_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| {
            let idx = rng.gen_range(0..36u32);
            char::from_digit(idx, 36).unwrap_or('0')
        })
        .collect()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn validate_collection(collection: &str) -> Result<()> {
    let valid = !collection.is_empty()
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(PortalError::InvalidRecord(format!(
            "invalid collection name: {:?}",
            collection
        )))
    }
}

fn into_object(data: Value) -> Result<Record> {
    match data {
        Value::Object(map) => Ok(map),
        other => Err(PortalError::InvalidRecord(format!(
            "expected a JSON object, got {}",
            match other {
                Value::Null => "null",
                Value::Bool(_) => "a boolean",
                Value::Number(_) => "a number",
                Value::String(_) => "a string",
                Value::Array(_) => "an array",
                Value::Object(_) => "an object",
            }
        ))),
    }
}

fn record_key(collection: &str, id: &str) -> String {
    format!("{}/{}", collection, id)
}

#[derive(Debug, Clone)]
struct Change {
    collection: String,
    snapshot: Arc<Vec<Record>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_records: usize,
    pub total_bytes: u64,
    pub collections: BTreeMap<String, usize>,
}

pub struct PortalStore {
    env: heed::Env,
    /// `collection/id` → record JSON
    records: Database<Str, Bytes>,
    changes: broadcast::Sender<Change>,
}

impl PortalStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_map_size(path, 10 * 1024 * 1024 * 1024) // 10GB
    }

    pub fn with_map_size<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(2)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let records = env.create_database(&mut wtxn, Some("records"))?;
        wtxn.commit()?;

        let (changes, _) = broadcast::channel(64);

        Ok(Self {
            env,
            records,
            changes,
        })
    }

    /// All records of a collection, ordered by id
    pub fn get(&self, collection: &str) -> Result<Vec<Record>> {
        validate_collection(collection)?;
        let rtxn = self.env.read_txn()?;
        let prefix = record_key(collection, "");
        let mut records = Vec::new();
        for item in self.records.prefix_iter(&rtxn, &prefix)? {
            let (_, bytes) = item?;
            records.push(serde_json::from_slice(bytes)?);
        }
        Ok(records)
    }

    pub fn get_item(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        validate_collection(collection)?;
        let rtxn = self.env.read_txn()?;
        match self.records.get(&rtxn, &record_key(collection, id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert a new record. A string `id` may be supplied, otherwise one
    /// is generated. Fails if the id is already taken.
    pub fn insert(&self, collection: &str, data: Value) -> Result<Record> {
        validate_collection(collection)?;
        let mut record = into_object(data)?;

        let id = match record.get("id") {
            None | Some(Value::Null) => generate_record_id(),
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(_) => {
                return Err(PortalError::InvalidRecord(
                    "id must be a non-empty string".to_string(),
                ))
            }
        };
        let now = now_secs();
        record.insert("id".to_string(), Value::String(id.clone()));
        record.entry("createdAt").or_insert(Value::from(now));
        record.insert("updatedAt".to_string(), Value::from(now));

        let key = record_key(collection, &id);
        let mut wtxn = self.env.write_txn()?;
        if self.records.get(&wtxn, &key)?.is_some() {
            return Err(PortalError::InvalidRecord(format!(
                "{} already exists",
                key
            )));
        }
        self.records
            .put(&mut wtxn, &key, &serde_json::to_vec(&record)?)?;
        wtxn.commit()?;

        debug!("Inserted {}", key);
        self.notify(collection);
        Ok(record)
    }

    /// Shallow-merge `partial` into an existing record. The id cannot change.
    pub fn update(&self, collection: &str, id: &str, partial: Value) -> Result<Record> {
        validate_collection(collection)?;
        let partial = into_object(partial)?;
        if let Some(new_id) = partial.get("id") {
            if new_id.as_str() != Some(id) {
                return Err(PortalError::InvalidRecord("id is immutable".to_string()));
            }
        }

        let key = record_key(collection, id);
        let mut wtxn = self.env.write_txn()?;
        let mut record: Record = match self.records.get(&wtxn, &key)? {
            Some(bytes) => serde_json::from_slice(bytes)?,
            None => return Err(PortalError::not_found(collection, id)),
        };
        for (field, value) in partial {
            record.insert(field, value);
        }
        record.insert("updatedAt".to_string(), Value::from(now_secs()));

        self.records
            .put(&mut wtxn, &key, &serde_json::to_vec(&record)?)?;
        wtxn.commit()?;

        debug!("Updated {}", key);
        self.notify(collection);
        Ok(record)
    }

    /// Remove a record. Returns whether it existed.
    pub fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        validate_collection(collection)?;
        let key = record_key(collection, id);
        let mut wtxn = self.env.write_txn()?;
        let deleted = self.records.delete(&mut wtxn, &key)?;
        wtxn.commit()?;

        if deleted {
            debug!("Deleted {}", key);
            self.notify(collection);
        }
        Ok(deleted)
    }

    /// Watch a collection. The first `recv` yields the current contents,
    /// later ones the contents after each change.
    pub fn subscribe(&self, collection: &str) -> Result<Subscription> {
        let rx = self.changes.subscribe();
        let initial = self.get(collection)?;
        Ok(Subscription {
            collection: collection.to_string(),
            initial: Some(initial),
            rx,
        })
    }

    /// Names of collections holding at least one record
    pub fn collections(&self) -> Result<Vec<String>> {
        Ok(self.stats()?.collections.into_keys().collect())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let rtxn = self.env.read_txn()?;
        let mut stats = StoreStats::default();
        for item in self.records.iter(&rtxn)? {
            let (key, bytes) = item?;
            let collection = key.split('/').next().unwrap_or(key);
            *stats.collections.entry(collection.to_string()).or_insert(0) += 1;
            stats.total_records += 1;
            stats.total_bytes += bytes.len() as u64;
        }
        Ok(stats)
    }

    fn notify(&self, collection: &str) {
        if self.changes.receiver_count() == 0 {
            return;
        }
        match self.get(collection) {
            Ok(snapshot) => {
                trace!("Publishing {} snapshot ({} records)", collection, snapshot.len());
                let _ = self.changes.send(Change {
                    collection: collection.to_string(),
                    snapshot: Arc::new(snapshot),
                });
            }
            Err(e) => debug!("Failed to snapshot {}: {}", collection, e),
        }
    }
}

/// Live view of one collection
pub struct Subscription {
    collection: String,
    initial: Option<Vec<Record>>,
    rx: broadcast::Receiver<Change>,
}

impl Subscription {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Next snapshot, or None once the store is gone
    pub async fn recv(&mut self) -> Option<Vec<Record>> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.rx.recv().await {
                Ok(change) if change.collection == self.collection => {
                    return Some(change.snapshot.as_ref().clone());
                }
                Ok(_) => continue,
                // Skipped snapshots are superseded by the next one
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Subscription to {} skipped {} changes", self.collection, n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}
