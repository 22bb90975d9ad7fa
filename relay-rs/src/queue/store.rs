//! Durable FIFO between acceptance and delivery
//!
//! Records are opaque serialized envelopes. Producers append at the tail;
//! the single delivery loop reads the head and removes it once processed.

use crate::error::Result;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A record at the head of the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRecord {
    pub id: i64,
    pub payload: String,
}

#[async_trait::async_trait]
pub trait DurableQueue: Send + Sync {
    /// Append to the tail
    async fn push_back(&self, payload: String) -> Result<()>;

    /// Oldest record, without removing it
    async fn peek_front(&self) -> Result<Option<QueuedRecord>>;

    /// Drop a record returned by `peek_front`
    async fn remove(&self, id: i64) -> Result<()>;

    async fn len(&self) -> Result<usize>;
}

/// SQLite-backed queue (table `email_queue`, FIFO by rowid)
pub struct SqliteQueue {
    db: Arc<SqlitePool>,
}

impl SqliteQueue {
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to an in-memory database sees a different database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let db = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS email_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&db)
        .await?;

        info!("Queue database ready at {}", database_url);
        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait::async_trait]
impl DurableQueue for SqliteQueue {
    async fn push_back(&self, payload: String) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO email_queue (payload, created_at)
            VALUES (?, ?)
            "#,
        )
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&*self.db)
        .await?;

        Ok(())
    }

    async fn peek_front(&self) -> Result<Option<QueuedRecord>> {
        let row = sqlx::query_as::<_, (i64, String)>(
            r#"
            SELECT id, payload
            FROM email_queue
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.map(|(id, payload)| QueuedRecord { id, payload }))
    }

    async fn remove(&self, id: i64) -> Result<()> {
        debug!("Removing queue record {}", id);

        sqlx::query("DELETE FROM email_queue WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;

        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM email_queue")
            .fetch_one(&*self.db)
            .await?;

        Ok(count.0 as usize)
    }
}

/// Process-local queue; contents are lost on restart
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<MemoryQueueInner>,
}

#[derive(Default)]
struct MemoryQueueInner {
    next_id: i64,
    records: VecDeque<QueuedRecord>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads currently queued, head first
    pub async fn snapshot(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.records.iter().map(|r| r.payload.clone()).collect()
    }
}

#[async_trait::async_trait]
impl DurableQueue for MemoryQueue {
    async fn push_back(&self, payload: String) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.records.push_back(QueuedRecord { id, payload });
        Ok(())
    }

    async fn peek_front(&self) -> Result<Option<QueuedRecord>> {
        Ok(self.inner.lock().await.records.front().cloned())
    }

    async fn remove(&self, id: i64) -> Result<()> {
        self.inner.lock().await.records.retain(|r| r.id != id);
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.inner.lock().await.records.len())
    }
}
