use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use super::{CacheBackend, CachedDigest, KeyPattern, backend_error};
use crate::digest::Digest;
use crate::error::Result;

/// A stored resource and its digest, keyed by primary key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub primary_key: String,
    pub digest: Option<Digest>,
    pub data: Vec<u8>,
}

/// Forward-only iteration over the records of an object store
#[async_trait]
pub trait RecordCursor: Send {
    async fn next_record(&mut self) -> Result<Option<Record>>;
}

/// Structured local database engine
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn open_cursor(&self, database: &str, object_store: &str) -> Result<Box<dyn RecordCursor>>;
    async fn get(&self, database: &str, object_store: &str, key: &str) -> Result<Option<Record>>;
    async fn put(&self, database: &str, object_store: &str, record: Record) -> Result<()>;
}

type StoreKey = (String, String);

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    stores: Mutex<HashMap<StoreKey, BTreeMap<String, Record>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn stores(&self) -> std::sync::MutexGuard<'_, HashMap<StoreKey, BTreeMap<String, Record>>> {
        self.stores.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct SnapshotCursor {
    records: VecDeque<Record>,
}

#[async_trait]
impl RecordCursor for SnapshotCursor {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        Ok(self.records.pop_front())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn open_cursor(&self, database: &str, object_store: &str) -> Result<Box<dyn RecordCursor>> {
        let records = self
            .stores()
            .get(&(database.to_string(), object_store.to_string()))
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        Ok(Box::new(SnapshotCursor { records }))
    }

    async fn get(&self, database: &str, object_store: &str, key: &str) -> Result<Option<Record>> {
        Ok(self
            .stores()
            .get(&(database.to_string(), object_store.to_string()))
            .and_then(|records| records.get(key).cloned()))
    }

    async fn put(&self, database: &str, object_store: &str, record: Record) -> Result<()> {
        self.stores()
            .entry((database.to_string(), object_store.to_string()))
            .or_default()
            .insert(record.primary_key.clone(), record);
        Ok(())
    }
}

/// Cache backend over a named database and object store
///
/// Local databases are usually bound to the thread that opened them, so by
/// default the backend declares itself unavailable to the save worker.
pub struct RecordBackend<S> {
    id: String,
    store: S,
    database: String,
    object_store: String,
    pattern: KeyPattern,
    worker_access: bool,
}

impl<S: RecordStore> RecordBackend<S> {
    pub fn new(
        id: impl Into<String>,
        store: S,
        database: impl Into<String>,
        object_store: impl Into<String>,
        pattern: KeyPattern,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            database: database.into(),
            object_store: object_store.into(),
            pattern,
            worker_access: false,
        }
    }

    /// Declare the store reachable from the save worker
    pub fn with_worker_access(mut self, enabled: bool) -> Self {
        self.worker_access = enabled;
        self
    }
}

#[async_trait]
impl<S: RecordStore> CacheBackend for RecordBackend<S> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_digests(&self) -> Result<Vec<CachedDigest>> {
        let mut cursor = self
            .store
            .open_cursor(&self.database, &self.object_store)
            .await?;
        let mut listed = Vec::new();
        while let Some(record) = cursor.next_record().await? {
            if let (Some(name), Some(digest)) = (self.pattern.name_of(&record.primary_key), record.digest) {
                listed.push(CachedDigest { name, digest });
            }
        }
        Ok(listed)
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let key = self.pattern.key_for(name);
        self.store
            .get(&self.database, &self.object_store, &key)
            .await?
            .map(|record| record.data)
            .ok_or_else(|| backend_error(format!("no record {key} in {}", self.object_store)))
    }

    async fn store(&self, name: &str, digest: &Digest, data: &[u8]) -> Result<()> {
        let record = Record {
            primary_key: self.pattern.key_for(name),
            digest: Some(digest.clone()),
            data: data.to_vec(),
        };
        self.store
            .put(&self.database, &self.object_store, record)
            .await
    }

    fn available_in_worker(&self) -> bool {
        self.worker_access
    }
}
