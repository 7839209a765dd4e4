//! Key-value store abstraction backing the peerstore.
//!
//! The peerstore only needs a tiny capability surface: point get/put,
//! prefix scans and write batches. Anything providing [`KVStore`] can back
//! it; the crate ships an in-memory map and a SQLite file store. Wrapping
//! stores compose by delegation, not inheritance.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

/// Minimal key-value capability used by the peerstore
#[async_trait]
pub trait KVStore: Send + Sync {
    /// Fetch a value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or replace a value
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove a key (absent keys are fine)
    async fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, sorted by key
    async fn query_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Start a write batch; mutations apply atomically on commit
    fn batch(&self) -> Box<dyn KVBatch>;

    /// Does the key exist?
    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// An accumulating write batch
#[async_trait]
pub trait KVBatch: Send {
    /// Queue an insert/replace
    fn put(&mut self, key: String, value: Vec<u8>);

    /// Queue a delete
    fn delete(&mut self, key: String);

    /// Number of queued operations
    fn len(&self) -> usize;

    /// True when nothing is queued
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply all queued operations
    async fn commit(self: Box<Self>) -> Result<()>;
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// Non-persistent store over a sorted map
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    map: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

#[async_trait]
impl KVStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.map.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    async fn query_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let map = self.map.read();
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn batch(&self) -> Box<dyn KVBatch> {
        Box::new(MemoryBatch {
            map: self.map.clone(),
            ops: Vec::new(),
        })
    }
}

enum BatchOp {
    Put(String, Vec<u8>),
    Delete(String),
}

struct MemoryBatch {
    map: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    ops: Vec<BatchOp>,
}

#[async_trait]
impl KVBatch for MemoryBatch {
    fn put(&mut self, key: String, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    fn delete(&mut self, key: String) {
        self.ops.push(BatchOp::Delete(key));
    }

    fn len(&self) -> usize {
        self.ops.len()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut map = self.map.write();
        for op in self.ops {
            match op {
                BatchOp::Put(key, value) => {
                    map.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
