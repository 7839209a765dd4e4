//! SQLite-backed [`KVStore`].
//!
//! One `kv` table, keys as text, values as blobs. The connection sits
//! behind a mutex; peerstore traffic is light and the per-peer locks above
//! this layer already serialize the hot paths.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::peerstore::store::{KVBatch, KVStore};

/// Persistent store over a SQLite database file
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<SqliteStore> {
        Self::init(Connection::open(path)?)
    }

    /// Fully in-memory database (tests)
    pub fn open_in_memory() -> Result<SqliteStore> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<SqliteStore> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )?;
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl KVStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn query_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT key, value FROM kv WHERE key LIKE ?1 || '%' ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn batch(&self) -> Box<dyn KVBatch> {
        Box::new(SqliteBatch {
            conn: self.conn.clone(),
            ops: Vec::new(),
        })
    }
}

enum BatchOp {
    Put(String, Vec<u8>),
    Delete(String),
}

struct SqliteBatch {
    conn: Arc<Mutex<Connection>>,
    ops: Vec<BatchOp>,
}

#[async_trait]
impl KVBatch for SqliteBatch {
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
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for op in &self.ops {
            match op {
                BatchOp::Put(key, value) => {
                    tx.execute(
                        "INSERT INTO kv (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        params![key, value],
                    )?;
                }
                BatchOp::Delete(key) => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_crud() {
        let store = SqliteStore::open_in_memory().unwrap();

        store.put("k", vec![9, 8, 7]).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(vec![9, 8, 7]));

        store.put("k", vec![1]).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(vec![1]));

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_prefix_scan() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put("/peers/protocols/a", vec![1]).await.unwrap();
        store.put("/peers/protocols/b", vec![2]).await.unwrap();
        store.put("/peers/addresses/a", vec![3]).await.unwrap();

        let hits = store.query_prefix("/peers/protocols/").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|(k, _)| k.starts_with("/peers/protocols/")));
    }

    #[tokio::test]
    async fn test_sqlite_batch() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put("old", vec![0]).await.unwrap();

        let mut batch = store.batch();
        batch.put("x".into(), vec![1]);
        batch.delete("old".into());
        batch.commit().await.unwrap();

        assert_eq!(store.get("x").await.unwrap(), Some(vec![1]));
        assert_eq!(store.get("old").await.unwrap(), None);
    }
}
