//! Asynchronous remote mirror.
//!
//! Consumes the store's committed-change feed and replays each change as an
//! upsert against a hosted PostgREST-style service. The mirror is strictly
//! write-behind: nothing in the pipeline ever reads from it, and a remote
//! outage never blocks the store. The in-memory queue is bounded; overflow
//! evicts the oldest log-entry changes first and never file/batch rows.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use pixferry_core::{PipelineError, PipelineResult};

use crate::change::Change;
use crate::store::MetaStore;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub url: String,
    pub api_key: String,
    pub queue_cap: usize,
}

pub struct MetaStoreMirror {
    store: MetaStore,
    config: Option<MirrorConfig>,
    client: reqwest::Client,
    queue: Mutex<VecDeque<Change>>,
    remote_ok: AtomicBool,
}

impl MetaStoreMirror {
    /// `config = None` disables mirroring entirely; changes are discarded
    /// and the mirror always reports itself caught up.
    pub fn new(store: MetaStore, config: Option<MirrorConfig>) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            store,
            config,
            client,
            queue: Mutex::new(VecDeque::new()),
            remote_ok: AtomicBool::new(true),
        })
    }

    /// Start the background pump consuming the store's change feed. Flushes
    /// opportunistically; failures leave the queue intact for the next tick.
    pub fn spawn(self: &Arc<Self>, mut feed: mpsc::UnboundedReceiver<Change>) -> JoinHandle<()> {
        let mirror = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(FLUSH_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    change = feed.recv() => {
                        match change {
                            Some(change) => mirror.enqueue(change).await,
                            None => {
                                // Store dropped; final flush and stop.
                                if let Err(e) = mirror.flush().await {
                                    tracing::warn!(error = %e, "final mirror flush failed");
                                }
                                break;
                            }
                        }
                    }
                    _ = tick.tick() => {
                        if let Err(e) = mirror.flush().await {
                            tracing::debug!(error = %e, "mirror flush deferred");
                        }
                    }
                }
            }
        })
    }

    /// Queue a change for replication, applying the bounded-queue policy.
    pub async fn enqueue(&self, change: Change) {
        let Some(config) = &self.config else {
            return;
        };
        let mut queue = self.queue.lock().await;
        if queue.len() >= config.queue_cap {
            // Evict the oldest log entry; file/batch rows are never dropped.
            if let Some(pos) = queue.iter().position(Change::is_log) {
                queue.remove(pos);
                tracing::warn!(cap = config.queue_cap, "mirror queue full, dropped oldest log entry");
            } else if change.is_log() {
                tracing::warn!(cap = config.queue_cap, "mirror queue full, dropped incoming log entry");
                return;
            }
        }
        queue.push_back(change);
    }

    /// Push everything queued. On the first remote failure the remaining
    /// queue (including the failed change) is retained and
    /// `ErrRemoteUnavailable` is returned.
    pub async fn flush(&self) -> PipelineResult<usize> {
        if self.config.is_none() {
            return Ok(0);
        }
        let mut pushed = 0usize;
        loop {
            let change = {
                let mut queue = self.queue.lock().await;
                match queue.pop_front() {
                    Some(change) => change,
                    None => break,
                }
            };
            match self.push(&change).await {
                Ok(()) => {
                    pushed += 1;
                    self.remote_ok.store(true, Ordering::Relaxed);
                    self.acknowledge(&change).await;
                }
                Err(e) => {
                    self.queue.lock().await.push_front(change);
                    self.remote_ok.store(false, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
        Ok(pushed)
    }

    /// Compare local and remote row counts, requeue every unsynced file and
    /// batch row, then flush.
    pub async fn reconcile(&self) -> PipelineResult<()> {
        if self.config.is_none() {
            return Ok(());
        }
        for table in ["media_files", "batches"] {
            match self.remote_count(table).await {
                Ok(count) => tracing::info!(table, remote_rows = count, "reconcile: remote count"),
                Err(e) => {
                    self.remote_ok.store(false, Ordering::Relaxed);
                    tracing::warn!(table, error = %e, "reconcile: remote unreachable");
                    return Err(e);
                }
            }
        }
        for file in self.store.unsynced_files().await? {
            self.enqueue(Change::FileUpserted(file)).await;
        }
        for batch in self.store.unsynced_batches().await? {
            self.enqueue(Change::BatchCreated(batch)).await;
        }
        self.flush().await?;
        Ok(())
    }

    /// Whether the queue is drained and the last remote exchange succeeded.
    pub async fn caught_up(&self) -> bool {
        if self.config.is_none() {
            return true;
        }
        self.queue.lock().await.is_empty() && self.remote_ok.load(Ordering::Relaxed)
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    async fn push(&self, change: &Change) -> PipelineResult<()> {
        let config = self.config.as_ref().expect("push requires config");
        let url = format!("{}/rest/v1/{}", config.url.trim_end_matches('/'), change.table());
        let response = self
            .client
            .post(&url)
            .header("apikey", &config.api_key)
            .header("Authorization", format!("Bearer {}", config.api_key))
            .header("Prefer", "resolution=merge-duplicates")
            .json(&[change.payload()])
            .send()
            .await
            .map_err(|e| PipelineError::RemoteUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PipelineError::RemoteUnavailable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }

    /// Flip the local `mirror_synced` flag for acknowledged file/batch rows.
    async fn acknowledge(&self, change: &Change) {
        let result = match change {
            Change::FileUpserted(f) | Change::FileStatusChanged(f) => {
                self.store.mark_file_mirror_synced(f.id).await
            }
            Change::BatchCreated(b) | Change::BatchStatusChanged(b) => {
                self.store.mark_batch_mirror_synced(b.id).await
            }
            Change::DuplicateRecorded(_) | Change::LogAppended(_) => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to flag mirror_synced");
        }
    }

    async fn remote_count(&self, table: &str) -> PipelineResult<Option<i64>> {
        let config = self.config.as_ref().expect("count requires config");
        let url = format!("{}/rest/v1/{}", config.url.trim_end_matches('/'), table);
        let response = self
            .client
            .get(&url)
            .query(&[("select", "id")])
            .header("apikey", &config.api_key)
            .header("Authorization", format!("Bearer {}", config.api_key))
            .header("Range", "0-0")
            .header("Prefer", "count=exact")
            .send()
            .await
            .map_err(|e| PipelineError::RemoteUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PipelineError::RemoteUnavailable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        // Content-Range: 0-0/123
        let count = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse::<i64>().ok());
        Ok(count)
    }
}
