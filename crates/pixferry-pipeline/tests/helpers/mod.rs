//! Shared fixtures for pipeline integration tests.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use pixferry_core::{NoOpNotifier, NoTwoFactorSource, PipelineConfig};
use pixferry_db::{HashIndex, MetaStore, MetaStoreMirror};
use pixferry_pipeline::PipelineContext;

/// Test application: a full pipeline context over a temp directory tree, an
/// in-memory store, and a disabled mirror.
pub struct TestApp {
    pub ctx: PipelineContext,
    _dir: tempfile::TempDir,
}

impl TestApp {
    pub fn nas(&self) -> &std::path::Path {
        &self.ctx.config.paths.nas_mount
    }

    /// Swap in a tweaked configuration.
    pub fn reconfigure(&mut self, f: impl FnOnce(&mut PipelineConfig)) {
        let mut config = (*self.ctx.config).clone();
        f(&mut config);
        self.ctx.config = Arc::new(config);
    }
}

pub async fn setup_test_app(extra_config: &str) -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let raw = format!(
        "NAS_MOUNT={}\nLOCAL_DB_PATH={}\nSYNCTHING_API_KEY=test-key\n{}",
        dir.path().display(),
        dir.path().join("pixferry.db").display(),
        extra_config
    );
    let config = Arc::new(PipelineConfig::parse(&raw).expect("test config"));
    let store = MetaStore::open_in_memory().await.expect("store");
    let hash_index = Arc::new(HashIndex::warm(&store).await.expect("hash index"));
    let mirror = MetaStoreMirror::new(store.clone(), None);

    TestApp {
        ctx: PipelineContext {
            config,
            store,
            hash_index,
            mirror,
            notifier: Arc::new(NoOpNotifier),
            two_factor: Arc::new(NoTwoFactorSource),
            cancel: CancellationToken::new(),
        },
        _dir: dir,
    }
}

/// Minimal canned-response HTTP server standing in for the sync daemon's
/// status endpoint. Serves the same body to every request.
pub async fn fake_syncthing(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
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
