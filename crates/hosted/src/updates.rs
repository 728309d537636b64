//! Document update queue.
//!
//! Edits produce a steady stream of "doc X was edited at T" events; writing
//! each one through would hammer the home database. The queue coalesces
//! per doc and flushes a batch after a debounce window, so the write rate
//! is bounded by the window regardless of edit rate.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

/// One "last edited" record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocUpdate {
    pub doc_id: String,
    pub updated_at: time::OffsetDateTime,
    pub edited_by: Option<i64>,
}

/// Far side of the queue: the workspace/home database.
#[async_trait]
pub trait DocUpdateSink: Send + Sync + 'static {
    async fn push_updates(
        &self,
        updates: &[DocUpdate],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Recording sink for tests.
#[derive(Default)]
pub struct MemoryUpdateSink {
    received: Mutex<Vec<DocUpdate>>,
}

impl MemoryUpdateSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<DocUpdate> {
        self.received.lock().expect("sink poisoned").clone()
    }
}

#[async_trait]
impl DocUpdateSink for MemoryUpdateSink {
    async fn push_updates(
        &self,
        updates: &[DocUpdate],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.received
            .lock()
            .expect("sink poisoned")
            .extend_from_slice(updates);
        Ok(())
    }
}

/// SQLite-backed sink.
pub struct SqliteUpdateSink {
    pool: Pool<Sqlite>,
}

impl SqliteUpdateSink {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        // SQLite permits limited write concurrency; a single connection
        // avoids "database is locked" failures under concurrent flushes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS doc_updates (
                doc_id TEXT PRIMARY KEY,
                updated_at INTEGER NOT NULL,
                edited_by INTEGER
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl DocUpdateSink for SqliteUpdateSink {
    async fn push_updates(
        &self,
        updates: &[DocUpdate],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        for update in updates {
            sqlx::query(
                "INSERT INTO doc_updates (doc_id, updated_at, edited_by)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(doc_id) DO UPDATE SET
                     updated_at = excluded.updated_at,
                     edited_by = excluded.edited_by",
            )
            .bind(&update.doc_id)
            .bind(update.updated_at.unix_timestamp())
            .bind(update.edited_by)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

struct QueueInner {
    sink: Arc<dyn DocUpdateSink>,
    delay: Duration,
    pending: Mutex<HashMap<String, DocUpdate>>,
    wake: Notify,
    shutdown: Notify,
    closed: AtomicBool,
}

impl QueueInner {
    async fn flush(&self) {
        let batch: Vec<DocUpdate> = {
            let mut pending = self.pending.lock().expect("queue poisoned");
            pending.drain().map(|(_, update)| update).collect()
        };
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.sink.push_updates(&batch).await {
            warn!(count = batch.len(), error = %e, "failed to push doc updates");
            // Keep the records for the next flush; a fresher update for the
            // same doc wins.
            let mut pending = self.pending.lock().expect("queue poisoned");
            for update in batch {
                pending.entry(update.doc_id.clone()).or_insert(update);
            }
        }
    }
}

/// Debounced, batched emitter of doc update records.
pub struct DocUpdateQueue {
    inner: Arc<QueueInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DocUpdateQueue {
    pub fn new(sink: Arc<dyn DocUpdateSink>, delay: Duration) -> Self {
        let inner = Arc::new(QueueInner {
            sink,
            delay,
            pending: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let task = tokio::spawn(Self::run(inner.clone()));
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(inner: Arc<QueueInner>) {
        loop {
            {
                let empty = inner.pending.lock().expect("queue poisoned").is_empty();
                if empty {
                    if inner.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    inner.wake.notified().await;
                }
            }
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(inner.delay) => {}
                _ = inner.shutdown.notified() => {}
            }
            inner.flush().await;
        }
    }

    /// Record that a doc was edited now. Later calls for the same doc
    /// within the window replace earlier ones.
    pub fn schedule_update(&self, doc_id: &str, edited_by: Option<i64>) {
        if self.inner.closed.load(Ordering::SeqCst) {
            warn!(doc_id, "doc update scheduled after close; dropped");
            return;
        }
        let update = DocUpdate {
            doc_id: doc_id.to_string(),
            updated_at: time::OffsetDateTime::now_utc(),
            edited_by,
        };
        self.inner
            .pending
            .lock()
            .expect("queue poisoned")
            .insert(doc_id.to_string(), update);
        self.inner.wake.notify_one();
    }

    /// Number of coalesced records not yet flushed.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("queue poisoned").len()
    }

    /// Flush everything pending right now (tests).
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Drain and stop. Idempotent.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        self.inner.shutdown.notify_one();
        let task = self.task.lock().expect("queue poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_updates_coalesce_per_doc() {
        let sink = Arc::new(MemoryUpdateSink::new());
        let queue = DocUpdateQueue::new(sink.clone(), Duration::from_millis(50));

        queue.schedule_update("doc1", Some(7));
        queue.schedule_update("doc1", Some(8));
        queue.schedule_update("doc2", None);
        assert_eq!(queue.pending_count(), 2);

        tokio::time::advance(Duration::from_millis(60)).await;
        queue.close().await;

        let received = sink.received();
        assert_eq!(received.len(), 2);
        let doc1 = received.iter().find(|u| u.doc_id == "doc1").unwrap();
        // The latest edit wins.
        assert_eq!(doc1.edited_by, Some(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drains_pending() {
        let sink = Arc::new(MemoryUpdateSink::new());
        let queue = DocUpdateQueue::new(sink.clone(), Duration::from_secs(3600));

        queue.schedule_update("doc", None);
        queue.close().await;

        assert_eq!(sink.received().len(), 1);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_sqlite_sink_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteUpdateSink::new(dir.path().join("home.db")).await.unwrap();

        let first = DocUpdate {
            doc_id: "doc".to_string(),
            updated_at: time::OffsetDateTime::from_unix_timestamp(1_000).unwrap(),
            edited_by: Some(1),
        };
        let second = DocUpdate {
            updated_at: time::OffsetDateTime::from_unix_timestamp(2_000).unwrap(),
            edited_by: Some(2),
            ..first.clone()
        };
        sink.push_updates(&[first]).await.unwrap();
        sink.push_updates(&[second]).await.unwrap();

        let row: (i64, Option<i64>) =
            sqlx::query_as("SELECT updated_at, edited_by FROM doc_updates WHERE doc_id = 'doc'")
                .fetch_one(sink.pool())
                .await
                .unwrap();
        assert_eq!(row, (2_000, Some(2)));
    }
}
