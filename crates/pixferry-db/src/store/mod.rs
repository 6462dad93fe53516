//! The local metadata store.
//!
//! Single SQLite file, WAL mode. Single-writer discipline: all mutations run
//! inside [`MetaStore::with_write`], which serializes writers behind an async
//! mutex and rejects nested write entry from the same task with
//! [`PipelineError::Reentrant`]. Readers never take the write lock.

mod batches;
mod duplicates;
mod files;
mod logs;
mod migrate;

use std::cell::Cell;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use pixferry_core::{PipelineError, PipelineResult};

use crate::change::Change;

pub use files::FileUpdate;

tokio::task_local! {
    /// Set while the current task holds the write lock; nested write entry
    /// from the same task would deadlock, so it is rejected instead.
    static IN_WRITE: Cell<bool>;
}

#[derive(Clone)]
pub struct MetaStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
    change_tx: mpsc::UnboundedSender<Change>,
    change_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Change>>>>,
}

impl MetaStore {
    /// Open (or create) the store at `path`, applying additive migrations.
    pub async fn open(path: &Path) -> PipelineResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// In-memory store for tests. A single connection keeps the database
    /// alive and shared.
    pub async fn open_in_memory() -> PipelineResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(PipelineError::Database)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> PipelineResult<Self> {
        migrate::run(&pool).await?;
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            change_tx,
            change_rx: Arc::new(Mutex::new(Some(change_rx))),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Hand out the committed-change feed. Callable once; the mirror is the
    /// intended consumer. Subsequent calls return `None`.
    pub async fn take_change_feed(&self) -> Option<mpsc::UnboundedReceiver<Change>> {
        self.change_rx.lock().await.take()
    }

    /// Emit a committed change. Silently a no-op once the consumer is gone.
    pub(crate) fn emit(&self, change: Change) {
        let _ = self.change_tx.send(change);
    }

    /// Run `op` holding the exclusive write lock.
    ///
    /// The operation opens and commits its own transaction on the pool it is
    /// given; a crash between commits leaves the store at the last committed
    /// boundary.
    pub(crate) async fn with_write<F, Fut, T>(&self, op: F) -> PipelineResult<T>
    where
        F: FnOnce(SqlitePool) -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        if IN_WRITE.try_with(Cell::get).unwrap_or(false) {
            return Err(PipelineError::Reentrant);
        }
        let _guard = self.write_lock.lock().await;
        IN_WRITE.scope(Cell::new(true), op(self.pool.clone())).await
    }
}
