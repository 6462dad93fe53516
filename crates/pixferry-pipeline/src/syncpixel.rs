//! Paired-device upload via the file-sync daemon.
//!
//! The pixel bridge doubles as the daemon's watched folder. The phase polls
//! the folder-status endpoint until the folder reports `idle` with zero
//! pending files and bytes on two consecutive polls (a single idle reading
//! can be a false lull between scan and transfer), then records the shipment
//! as uploaded. A timeout leaves every file safely at `batched`.

use std::time::{Duration, Instant};

use serde::Deserialize;

use pixferry_core::models::{BatchStatus, PhaseName, PhaseOutcome, Severity, UploadKind};
use pixferry_core::{PipelineError, PipelineResult, PixelPolicy};

use crate::context::PipelineContext;
use crate::stage::BridgeLock;
use crate::uploader::{bridge_entries, finish_upload, map_bridge_entry};

#[derive(Debug, Deserialize)]
struct FolderStatus {
    state: String,
    #[serde(rename = "needFiles", default)]
    need_files: u64,
    #[serde(rename = "needBytes", default)]
    need_bytes: u64,
}

impl FolderStatus {
    fn is_settled(&self) -> bool {
        self.state == "idle" && self.need_files == 0 && self.need_bytes == 0
    }
}

pub struct SyncPixelPhase;

impl SyncPixelPhase {
    pub async fn run(&self, ctx: &PipelineContext) -> PhaseOutcome {
        let mut outcome = PhaseOutcome::new(PhaseName::SyncPixel);
        let start = Instant::now();
        let policy = &ctx.config.pixel;
        let bridge_dir = ctx.config.paths.bridge_pixel_dir.clone();

        let entries = match bridge_entries(&bridge_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                outcome.started = false;
                outcome.error = Some(e.to_string());
                outcome.duration = start.elapsed();
                return outcome;
            }
        };
        if entries.is_empty() {
            outcome.duration = start.elapsed();
            return outcome;
        }

        let _lock = match BridgeLock::acquire(&bridge_dir).await {
            Ok(lock) => lock,
            Err(e) => {
                outcome.started = false;
                outcome.error = Some(e.to_string());
                outcome.duration = start.elapsed();
                return outcome;
            }
        };

        // The watched folder normally is the bridge; mirror the shipment
        // over when an operator points the daemon somewhere else.
        if ctx.config.paths.pixel_sync_folder != bridge_dir {
            if let Err(e) = self.mirror_into_sync_folder(ctx, &entries).await {
                outcome.started = false;
                outcome.error = Some(e.to_string());
                outcome.duration = start.elapsed();
                return outcome;
            }
        }

        let batch = match ctx.store.latest_open_batch(UploadKind::Pixel).await {
            Ok(batch) => batch,
            Err(e) => {
                outcome.started = false;
                outcome.error = Some(e.to_string());
                outcome.duration = start.elapsed();
                return outcome;
            }
        };
        if let Some(batch) = &batch {
            if batch.status == BatchStatus::Created {
                let _ = ctx
                    .store
                    .set_batch_status(batch.id, BatchStatus::Uploading, None)
                    .await;
            }
        }

        match self.await_settled(ctx, policy).await {
            Ok(()) => {}
            Err(e) => {
                // Files stay at batched; the next run retries the shipment.
                if let Some(batch) = &batch {
                    let _ = ctx
                        .store
                        .set_batch_status(batch.id, BatchStatus::Error, Some(chrono::Utc::now()))
                        .await;
                }
                ctx.log(
                    PhaseName::SyncPixel,
                    Severity::Error,
                    &format!("sync did not settle: {}", e),
                )
                .await;
                outcome.started = false;
                outcome.error = Some(e.to_string());
                outcome.duration = start.elapsed();
                return outcome;
            }
        }

        for entry in entries {
            outcome.processed += 1;
            match map_bridge_entry(ctx, &entry).await {
                Ok(Some(file)) => {
                    match finish_upload(ctx, UploadKind::Pixel, &entry, &file).await {
                        Ok(()) => outcome.succeeded += 1,
                        Err(e) => {
                            outcome.failed += 1;
                            ctx.log(
                                PhaseName::SyncPixel,
                                Severity::Error,
                                &format!("{}: post-sync move failed: {}", file.filename, e),
                            )
                            .await;
                        }
                    }
                }
                Ok(None) => {
                    outcome.skipped += 1;
                    tracing::warn!(entry = %entry.display(), "untracked bridge entry, leaving in place");
                }
                Err(e) => {
                    outcome.failed += 1;
                    ctx.log(
                        PhaseName::SyncPixel,
                        Severity::Error,
                        &format!("{}: {}", entry.display(), e),
                    )
                    .await;
                }
            }
        }

        if let Some(batch) = batch {
            let final_status = if outcome.succeeded > 0 || outcome.processed == 0 {
                BatchStatus::Uploaded
            } else {
                BatchStatus::Error
            };
            let _ = ctx
                .store
                .set_batch_status(batch.id, final_status, Some(chrono::Utc::now()))
                .await;
        }

        outcome.duration = start.elapsed();
        outcome
    }

    async fn mirror_into_sync_folder(
        &self,
        ctx: &PipelineContext,
        entries: &[std::path::PathBuf],
    ) -> PipelineResult<()> {
        let sync_folder = &ctx.config.paths.pixel_sync_folder;
        tokio::fs::create_dir_all(sync_folder).await?;
        for entry in entries {
            if let Some(name) = entry.file_name() {
                let target = sync_folder.join(name);
                if !target.exists() {
                    tokio::fs::copy(entry, &target).await?;
                }
            }
        }
        Ok(())
    }

    /// Poll the daemon until the folder settles or the deadline passes.
    async fn await_settled(
        &self,
        ctx: &PipelineContext,
        policy: &PixelPolicy,
    ) -> PipelineResult<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        let url = format!(
            "{}/rest/db/status",
            policy.api_url.trim_end_matches('/')
        );
        let deadline = Instant::now() + Duration::from_secs(policy.sync_timeout_secs);
        let mut consecutive_settled = 0u32;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(PipelineError::SyncTimeout(policy.sync_timeout_secs));
            }
            match self.folder_status(&client, &url, policy).await {
                Ok(status) => {
                    tracing::debug!(
                        state = %status.state,
                        need_files = status.need_files,
                        need_bytes = status.need_bytes,
                        "folder status"
                    );
                    if status.is_settled() {
                        consecutive_settled += 1;
                        if consecutive_settled >= 2 {
                            return Ok(());
                        }
                    } else {
                        consecutive_settled = 0;
                    }
                }
                Err(e) => {
                    consecutive_settled = 0;
                    tracing::warn!(error = %e, "folder status request failed");
                }
            }
            if Instant::now() >= deadline {
                return Err(PipelineError::SyncTimeout(policy.sync_timeout_secs));
            }
            tokio::time::sleep(Duration::from_secs(policy.poll_interval_secs)).await;
        }
    }

    async fn folder_status(
        &self,
        client: &reqwest::Client,
        url: &str,
        policy: &PixelPolicy,
    ) -> PipelineResult<FolderStatus> {
        let response = client
            .get(url)
            .query(&[("folder", policy.folder_id.as_str())])
            .header("X-API-Key", &policy.api_key)
            .send()
            .await
            .map_err(|e| PipelineError::RemoteUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PipelineError::RemoteUnavailable(format!(
                "folder status returned {}",
                response.status()
            )));
        }
        response
            .json::<FolderStatus>()
            .await
            .map_err(|e| PipelineError::RemoteUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::context::PipelineContext;
    use pixferry_core::models::{FileStatus, IngestKind, MediaFile, NewMediaFile};
    use pixferry_db::FileUpdate;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal canned-response HTTP server for the status endpoint.
    async fn fake_syncthing(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}", addr)
    }

    async fn staged_file(ctx: &PipelineContext) -> MediaFile {
        let bridge = &ctx.config.paths.bridge_pixel_dir;
        tokio::fs::create_dir_all(bridge).await.unwrap();
        tokio::fs::write(bridge.join("a.jpg"), b"payload").await.unwrap();

        let file = ctx
            .store
            .upsert_file(NewMediaFile {
                filename: "a.jpg".into(),
                path: ctx.config.paths.compressed_dir.join("a.jpg"),
                source_path: "/camera/a.jpg".into(),
                size_bytes: 7,
                source_kind: IngestKind::Folder,
            })
            .await
            .unwrap();
        let file = ctx
            .store
            .update_file_status(
                file.id,
                FileStatus::Deduplicated,
                FileUpdate {
                    hash: Some("feedface".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let file = ctx
            .store
            .update_file_status(file.id, FileStatus::Compressed, FileUpdate::default())
            .await
            .unwrap();
        ctx.store
            .create_batch(UploadKind::Pixel, &[file.id])
            .await
            .unwrap();
        ctx.store.get_file(file.id).await.unwrap().unwrap()
    }

    fn set_pixel_policy(ctx: &mut PipelineContext, api_url: String, timeout_secs: u64) {
        let mut config = (*ctx.config).clone();
        config.pixel.api_url = api_url;
        config.pixel.sync_timeout_secs = timeout_secs;
        config.pixel.poll_interval_secs = 0;
        ctx.config = Arc::new(config);
    }

    #[tokio::test]
    async fn test_settled_folder_completes_shipment() {
        let (mut ctx, _guard) = test_context().await;
        let file = staged_file(&ctx).await;
        let url = fake_syncthing(r#"{"state":"idle","needFiles":0,"needBytes":0}"#).await;
        set_pixel_policy(&mut ctx, url, 30);

        let outcome = SyncPixelPhase.run(&ctx).await;
        assert!(outcome.started, "{:?}", outcome.error);
        assert_eq!(outcome.succeeded, 1);

        let file = ctx.store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Uploaded);
        assert!(file.path.starts_with(&ctx.config.paths.uploaded_pixel_dir));
        assert!(file.path.exists());
        assert!(!ctx.config.paths.bridge_pixel_dir.join("a.jpg").exists());

        let batch = ctx
            .store
            .get_batch(file.batch_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Uploaded);
        assert!(batch.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_syncing_forever_times_out_and_files_stay_batched() {
        let (mut ctx, _guard) = test_context().await;
        let file = staged_file(&ctx).await;
        let url = fake_syncthing(r#"{"state":"syncing","needFiles":3,"needBytes":9000}"#).await;
        set_pixel_policy(&mut ctx, url, 1);

        let outcome = SyncPixelPhase.run(&ctx).await;
        assert!(!outcome.started);
        assert!(outcome.error.as_deref().unwrap_or("").contains("settle"));

        let file = ctx.store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Batched);
        assert!(ctx.config.paths.bridge_pixel_dir.join("a.jpg").exists());

        let batch = ctx
            .store
            .get_batch(file.batch_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Error);
    }

    #[tokio::test]
    async fn test_empty_bridge_is_noop() {
        let (ctx, _guard) = test_context().await;
        let outcome = SyncPixelPhase.run(&ctx).await;
        assert!(outcome.started);
        assert_eq!(outcome.processed, 0);
    }
}
