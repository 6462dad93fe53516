//! End-to-end pipeline workflows over a real directory tree: folder ingest
//! through dedupe, compression, staging, the pixel sync destination, and
//! date-partitioned archival.

#[path = "helpers/mod.rs"]
mod helpers;

use helpers::{fake_syncthing, setup_test_app};

use chrono::{Datelike, Utc};
use pixferry_core::models::{BatchStatus, FileStatus, UploadKind};
use pixferry_pipeline::Orchestrator;

/// Write a camera folder with the given files and enable folder ingest.
async fn seed_camera(app: &mut helpers::TestApp, files: &[(&str, &[u8])]) {
    let camera = app.nas().join("camera");
    tokio::fs::create_dir_all(&camera).await.unwrap();
    for (name, payload) in files {
        tokio::fs::write(camera.join(name), payload).await.unwrap();
    }
    let camera = camera.display().to_string();
    app.reconfigure(move |c| {
        c.features.folder_download = true;
        c.dedupe.extra_directories = vec![camera.clone().into()];
    });
}

fn orchestrator(app: &helpers::TestApp) -> Orchestrator {
    let config = app.ctx.config.clone();
    Orchestrator::new(app.ctx.clone()).with_ingest_source(std::sync::Arc::new(
        pixferry_pipeline::ingest::FolderIngest::new(
            config.dedupe.extra_directories.clone(),
            config.paths.originals_dir.clone(),
        ),
    ))
}

#[tokio::test]
async fn test_full_pipeline_through_pixel_destination() {
    let mut app = setup_test_app("").await;
    seed_camera(
        &mut app,
        &[("a.bin", b"first payload".as_slice()), ("b.bin", b"second payload")],
    )
    .await;
    let url = fake_syncthing(r#"{"state":"idle","needFiles":0,"needBytes":0}"#).await;
    app.reconfigure(|c| {
        c.features.pixel_upload = true;
        c.pixel.api_url = url;
        c.pixel.poll_interval_secs = 0;
        c.pixel.sync_timeout_secs = 30;
    });

    let report = orchestrator(&app).run().await.unwrap();
    assert_eq!(report.exit_code(), 0, "{}", report);
    assert!(report.error_file_ids.is_empty());
    assert!(report.mirror_caught_up);

    // Both files travelled the whole lifecycle.
    let verified = app
        .ctx
        .store
        .files_with_status(FileStatus::Verified)
        .await
        .unwrap();
    assert_eq!(verified.len(), 2);

    // One pixel batch, verified, with accurate totals.
    let batch = app
        .ctx
        .store
        .get_batch(verified[0].batch_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.destination, UploadKind::Pixel);
    assert_eq!(batch.status, BatchStatus::Verified);
    assert_eq!(batch.file_count, 2);
    assert_eq!(batch.total_size_bytes, 27);
    assert!(batch.completed_at.is_some());

    // Archived under today's date partition (opaque payloads fall back to
    // the filesystem date).
    let today = Utc::now().date_naive();
    let sorted_dir = app.ctx.config.paths.sorted_dir.join(format!(
        "{:04}/{:02}/{:02}",
        today.year(),
        today.month(),
        today.day()
    ));
    assert!(sorted_dir.join("a.bin").exists());
    assert!(sorted_dir.join("b.bin").exists());

    // Bridge drained; originals untouched.
    assert!(!app
        .ctx
        .config
        .paths
        .bridge_pixel_dir
        .join("a.bin")
        .exists());
    assert!(app.ctx.config.paths.originals_dir.join("a.bin").exists());
}

#[tokio::test]
async fn test_duplicate_within_run_only_survivor_ships() {
    let mut app = setup_test_app("").await;
    seed_camera(
        &mut app,
        &[
            ("x.bin", b"byte identical".as_slice()),
            ("x_copy.bin", b"byte identical"),
        ],
    )
    .await;
    let url = fake_syncthing(r#"{"state":"idle","needFiles":0,"needBytes":0}"#).await;
    app.reconfigure(|c| {
        c.features.pixel_upload = true;
        c.pixel.api_url = url;
        c.pixel.poll_interval_secs = 0;
        c.pixel.sync_timeout_secs = 30;
    });

    let report = orchestrator(&app).run().await.unwrap();
    assert_eq!(report.exit_code(), 0, "{}", report);

    assert_eq!(app.ctx.store.duplicate_count().await.unwrap(), 1);
    let verified = app
        .ctx
        .store
        .files_with_status(FileStatus::Verified)
        .await
        .unwrap();
    assert_eq!(verified.len(), 1);
    assert_eq!(verified[0].filename, "x.bin");

    // The copy sits quarantined, flagged, and never entered a batch.
    let quarantined = app
        .ctx
        .store
        .find_file_by_source(
            &app.nas().join("camera/x_copy.bin").display().to_string(),
            "x_copy.bin",
        )
        .await
        .unwrap()
        .unwrap();
    assert!(quarantined.is_duplicate);
    assert!(quarantined.batch_id.is_none());
    assert!(quarantined
        .path
        .starts_with(&app.ctx.config.paths.cleanup_dir));
    assert!(quarantined.path.exists());

    let batch = app
        .ctx
        .store
        .get_batch(verified[0].batch_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.file_count, 1);
}

#[tokio::test]
async fn test_sync_timeout_leaves_shipment_retriable() {
    let mut app = setup_test_app("").await;
    seed_camera(&mut app, &[("a.bin", b"payload".as_slice())]).await;
    let url = fake_syncthing(r#"{"state":"syncing","needFiles":1,"needBytes":7}"#).await;
    app.reconfigure(|c| {
        c.features.pixel_upload = true;
        c.pixel.api_url = url;
        c.pixel.poll_interval_secs = 0;
        c.pixel.sync_timeout_secs = 1;
    });

    let report = orchestrator(&app).run().await.unwrap();
    assert_eq!(report.exit_code(), 1);

    // The shipment is intact: file batched, bridge copy still present,
    // batch marked error.
    let batched = app
        .ctx
        .store
        .files_with_status(FileStatus::Batched)
        .await
        .unwrap();
    assert_eq!(batched.len(), 1);
    assert!(app
        .ctx
        .config
        .paths
        .bridge_pixel_dir
        .join("a.bin")
        .exists());
    let batch = app
        .ctx
        .store
        .get_batch(batched[0].batch_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.status, BatchStatus::Error);
}

#[tokio::test]
async fn test_interrupted_run_resumes_by_status() {
    let mut app = setup_test_app("").await;
    seed_camera(&mut app, &[("a.bin", b"payload".as_slice())]).await;

    // First run: everything up to compression only (no destinations on).
    let report = orchestrator(&app).run().await.unwrap();
    assert_eq!(report.exit_code(), 0);
    let compressed = app
        .ctx
        .store
        .files_with_status(FileStatus::Compressed)
        .await
        .unwrap();
    assert_eq!(compressed.len(), 1);
    let compressed_at = compressed[0].updated_at;

    // Second run with the pixel destination enabled picks the file up at
    // `compressed` without re-ingesting or recompressing it.
    let url = fake_syncthing(r#"{"state":"idle","needFiles":0,"needBytes":0}"#).await;
    app.reconfigure(|c| {
        c.features.pixel_upload = true;
        c.pixel.api_url = url;
        c.pixel.poll_interval_secs = 0;
        c.pixel.sync_timeout_secs = 30;
    });
    let report = orchestrator(&app).run().await.unwrap();
    assert_eq!(report.exit_code(), 0, "{}", report);

    let verified = app
        .ctx
        .store
        .files_with_status(FileStatus::Verified)
        .await
        .unwrap();
    assert_eq!(verified.len(), 1);
    assert!(verified[0].updated_at > compressed_at);
}
