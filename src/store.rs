//! External storage collaborators: a TTL key-value cache, a blob store for transcripts, and a
//! relational chat index. Each has an in-memory implementation and a SQLite one.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

pub(crate) fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, String>;
    async fn put(&self, key: &str, value: String, ttl_seconds: u64) -> Result<(), String>;
}

#[derive(Clone, Default)]
pub struct MemoryKvStore {
    inner: Arc<RwLock<HashMap<String, (String, i64)>>>,
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, String> {
        let now = now_ts();
        let guard = self.inner.read().await;
        Ok(guard
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone()))
    }

    async fn put(&self, key: &str, value: String, ttl_seconds: u64) -> Result<(), String> {
        let now = now_ts();
        let mut guard = self.inner.write().await;
        guard.retain(|_, (_, expires_at)| *expires_at > now);
        guard.insert(key.to_string(), (value, now.saturating_add(ttl_seconds as i64)));
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteKvStore {
    pool: Pool<Sqlite>,
}

impl SqliteKvStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_entries (\
             key TEXT PRIMARY KEY,\
             value TEXT NOT NULL,\
             expires_at INTEGER NOT NULL\
             )",
        )
        .execute(&pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, String> {
        sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv_entries WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(now_ts())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| err.to_string())
    }

    async fn put(&self, key: &str, value: String, ttl_seconds: u64) -> Result<(), String> {
        let now = now_ts();
        sqlx::query("DELETE FROM kv_entries WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|err| err.to_string())?;
        sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES (?, ?, ?)\
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, expires_at=excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(now.saturating_add(ttl_seconds as i64))
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(())
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), String>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String>;
}

#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    inner: Arc<RwLock<HashMap<String, (Vec<u8>, String)>>>,
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        guard.insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        let guard = self.inner.read().await;
        Ok(guard.get(key).map(|(bytes, _)| bytes.clone()))
    }
}

#[derive(Clone)]
pub struct SqliteBlobStore {
    pool: Pool<Sqlite>,
}

impl SqliteBlobStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blobs (\
             key TEXT PRIMARY KEY,\
             content_type TEXT NOT NULL,\
             bytes BLOB NOT NULL\
             )",
        )
        .execute(&pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), String> {
        sqlx::query(
            "INSERT INTO blobs (key, content_type, bytes) VALUES (?, ?, ?)\
             ON CONFLICT(key) DO UPDATE SET content_type=excluded.content_type, bytes=excluded.bytes",
        )
        .bind(key)
        .bind(content_type)
        .bind(bytes)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        let row = sqlx::query("SELECT bytes FROM blobs WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| err.to_string())?;
        if let Some(row) = row {
            let bytes: Vec<u8> = row.try_get(0).map_err(|err| err.to_string())?;
            Ok(Some(bytes))
        } else {
            Ok(None)
        }
    }
}

/// One row of the chats index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatIndexRow {
    pub id: String,
    pub user_id: String,
    pub created_at: String,
    pub blob_key: String,
    pub model: String,
}

#[async_trait]
pub trait ChatIndex: Send + Sync {
    async fn insert(&self, row: ChatIndexRow) -> Result<(), String>;
    async fn recent(&self, limit: u32) -> Result<Vec<ChatIndexRow>, String>;
}

#[derive(Clone, Default)]
pub struct MemoryChatIndex {
    inner: Arc<RwLock<Vec<ChatIndexRow>>>,
}

#[async_trait]
impl ChatIndex for MemoryChatIndex {
    async fn insert(&self, row: ChatIndexRow) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        if guard.iter().any(|existing| existing.id == row.id) {
            return Err(format!("chat {} already indexed", row.id));
        }
        guard.push(row);
        Ok(())
    }

    async fn recent(&self, limit: u32) -> Result<Vec<ChatIndexRow>, String> {
        let guard = self.inner.read().await;
        let mut rows = guard.clone();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }
}

#[derive(Clone)]
pub struct SqliteChatIndex {
    pool: Pool<Sqlite>,
}

impl SqliteChatIndex {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                blob_key TEXT NOT NULL,
                model TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|err| err.to_string())?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chats_user_id ON chats(user_id)")
            .execute(&pool)
            .await
            .map_err(|err| err.to_string())?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chats_created_at ON chats(created_at)")
            .execute(&pool)
            .await
            .map_err(|err| err.to_string())?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ChatIndex for SqliteChatIndex {
    async fn insert(&self, row: ChatIndexRow) -> Result<(), String> {
        sqlx::query(
            "INSERT INTO chats (id, user_id, created_at, blob_key, model) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.user_id)
        .bind(&row.created_at)
        .bind(&row.blob_key)
        .bind(&row.model)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(())
    }

    async fn recent(&self, limit: u32) -> Result<Vec<ChatIndexRow>, String> {
        let rows = sqlx::query_as::<_, (String, String, String, String, String)>(
            "SELECT id, user_id, created_at, blob_key, model FROM chats \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(rows
            .into_iter()
            .map(|(id, user_id, created_at, blob_key, model)| ChatIndexRow {
                id,
                user_id,
                created_at,
                blob_key,
                model,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> Pool<Sqlite> {
        sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("memory pool")
    }

    #[tokio::test]
    async fn memory_kv_expires_entries() {
        let store = MemoryKvStore::default();
        store.put("a", "1".to_string(), 3600).await.unwrap();
        store.put("b", "2".to_string(), 0).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_kv_round_trip_and_overwrite() {
        let store = SqliteKvStore::new(memory_pool().await).await.unwrap();
        store.put("k", "v1".to_string(), 3600).await.unwrap();
        store.put("k", "v2".to_string(), 3600).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
        store.put("gone", "x".to_string(), 0).await.unwrap();
        assert_eq!(store.get("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_blob_store_returns_bytes() {
        let store = SqliteBlobStore::new(memory_pool().await).await.unwrap();
        store
            .put("chat-1.json", b"{}".to_vec(), "application/json")
            .await
            .unwrap();
        assert_eq!(store.get("chat-1.json").await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_chat_index_lists_newest_first() {
        let index = SqliteChatIndex::new(memory_pool().await).await.unwrap();
        for (id, ts) in [("a", "2025-01-01T00:00:00Z"), ("b", "2025-02-01T00:00:00Z")] {
            index
                .insert(ChatIndexRow {
                    id: id.to_string(),
                    user_id: "anonymous".to_string(),
                    created_at: ts.to_string(),
                    blob_key: format!("chat-{id}.json"),
                    model: "gpt".to_string(),
                })
                .await
                .unwrap();
        }
        let rows = index.recent(10).await.unwrap();
        assert_eq!(rows[0].id, "b");
        assert_eq!(rows.len(), 2);
        assert_eq!(index.recent(1).await.unwrap().len(), 1);
    }
}
