//! Mirror replication against a canned remote: outage behavior, recovery,
//! and reconciliation of unsynced rows.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use pixferry_core::models::{FileStatus, IngestKind, NewMediaFile, UploadKind};
use pixferry_db::{FileUpdate, MetaStore, MetaStoreMirror, MirrorConfig};

/// Accepts every request: POSTs get 201, GETs get an empty page with a
/// Content-Range count. Counts accepted POSTs.
async fn fake_remote(post_count: Arc<AtomicUsize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..n]);
            let response = if request.starts_with("POST") {
                post_count.fetch_add(1, Ordering::SeqCst);
                "HTTP/1.1 201 Created\r\nContent-Length: 2\r\nConnection: close\r\n\r\n[]"
                    .to_string()
            } else {
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Range: 0-0/0\r\nContent-Length: 2\r\nConnection: close\r\n\r\n[]"
                    .to_string()
            };
            let _ = socket.write_all(response.as_bytes()).await;
        }
    });
    format!("http://{}", addr)
}

async fn seeded_store() -> MetaStore {
    let store = MetaStore::open_in_memory().await.unwrap();
    let file = store
        .upsert_file(NewMediaFile {
            filename: "a.jpg".into(),
            path: "/mnt/nas/originals/a.jpg".into(),
            source_path: "/camera/a.jpg".into(),
            size_bytes: 100,
            source_kind: IngestKind::Folder,
        })
        .await
        .unwrap();
    let file = store
        .update_file_status(
            file.id,
            FileStatus::Deduplicated,
            FileUpdate {
                hash: Some("cafebabe".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let file = store
        .update_file_status(file.id, FileStatus::Compressed, FileUpdate::default())
        .await
        .unwrap();
    store
        .create_batch(UploadKind::Pixel, &[file.id])
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_outage_queues_then_reconcile_drains() {
    let store = seeded_store().await;
    let posts = Arc::new(AtomicUsize::new(0));

    // Start against a dead endpoint: everything queues, nothing is lost.
    let mirror = MetaStoreMirror::new(
        store.clone(),
        Some(MirrorConfig {
            url: "http://127.0.0.1:1".to_string(),
            api_key: "key".to_string(),
            queue_cap: 100,
        }),
    );
    mirror.reconcile().await.unwrap_err();
    // Nothing was lost: the rows are still flagged unsynced locally.
    assert!(!store.unsynced_files().await.unwrap().is_empty());
    assert!(!store.unsynced_batches().await.unwrap().is_empty());

    // The remote comes back: reconciliation pushes the backlog and flips
    // the synced flags.
    let url = fake_remote(posts.clone()).await;
    let mirror = MetaStoreMirror::new(
        store.clone(),
        Some(MirrorConfig {
            url,
            api_key: "key".to_string(),
            queue_cap: 100,
        }),
    );
    mirror.reconcile().await.unwrap();
    assert!(mirror.caught_up().await);
    assert!(posts.load(Ordering::SeqCst) >= 2); // at least the file and the batch

    assert!(store.unsynced_files().await.unwrap().is_empty());
    assert!(store.unsynced_batches().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_change_feed_pump_acknowledges_rows() {
    let store = MetaStore::open_in_memory().await.unwrap();
    let posts = Arc::new(AtomicUsize::new(0));
    let url = fake_remote(posts.clone()).await;

    let mirror = MetaStoreMirror::new(
        store.clone(),
        Some(MirrorConfig {
            url,
            api_key: "key".to_string(),
            queue_cap: 100,
        }),
    );
    let feed = store.take_change_feed().await.unwrap();
    mirror.spawn(feed);

    let file = store
        .upsert_file(NewMediaFile {
            filename: "b.jpg".into(),
            path: "/mnt/nas/originals/b.jpg".into(),
            source_path: "/camera/b.jpg".into(),
            size_bytes: 5,
            source_kind: IngestKind::Folder,
        })
        .await
        .unwrap();

    // The pump receives the change asynchronously; poll until the remote
    // acknowledgment lands.
    let mut synced = false;
    for _ in 0..100 {
        let _ = mirror.flush().await;
        if store.get_file(file.id).await.unwrap().unwrap().mirror_synced {
            synced = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(synced, "change never replicated");
    assert!(posts.load(Ordering::SeqCst) >= 1);
}
