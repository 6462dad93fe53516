//! Cloud-photo-source ingest.
//!
//! The vendor protocol itself is an external collaborator; this adapter owns
//! the authentication flow (including the interactive two-factor window) and
//! the registration contract, delegating enumeration and download to a
//! [`CloudPhotoClient`] implementation supplied at startup.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pixferry_core::models::IngestKind;
use pixferry_core::{PipelineError, PipelineResult, TwoFactorSource};

use super::{IngestItem, IngestSource};

/// Result of an authentication attempt against the cloud source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Authenticated,
    /// The source challenged for a second factor; a code must be submitted
    /// before any other call succeeds.
    NeedsTwoFactor,
}

/// The vendor boundary. Implementations live outside this crate.
#[async_trait]
pub trait CloudPhotoClient: Send + Sync {
    async fn authenticate(&self) -> PipelineResult<AuthState>;

    /// Submit a 2FA code; `true` means the session is now authenticated.
    async fn submit_code(&self, code: &str) -> PipelineResult<bool>;

    /// Enumerate recently added assets.
    async fn list_recent(&self) -> PipelineResult<Vec<IngestItem>>;

    /// Download one asset into `dest_dir`, returning the local path.
    async fn download(&self, item: &IngestItem, dest_dir: &Path) -> PipelineResult<PathBuf>;
}

pub struct ICloudIngest {
    client: Arc<dyn CloudPhotoClient>,
    two_factor: Arc<dyn TwoFactorSource>,
    two_factor_wait: Duration,
    originals_dir: PathBuf,
}

impl ICloudIngest {
    pub fn new(
        client: Arc<dyn CloudPhotoClient>,
        two_factor: Arc<dyn TwoFactorSource>,
        two_factor_wait: Duration,
        originals_dir: PathBuf,
    ) -> Self {
        Self {
            client,
            two_factor,
            two_factor_wait,
            originals_dir,
        }
    }

    /// Complete authentication, driving the out-of-band 2FA channel when the
    /// source challenges. No code within the configured window is an auth
    /// failure.
    async fn ensure_authenticated(&self) -> PipelineResult<()> {
        match self.client.authenticate().await? {
            AuthState::Authenticated => Ok(()),
            AuthState::NeedsTwoFactor => {
                tracing::info!(
                    wait_secs = self.two_factor_wait.as_secs(),
                    "two-factor code required, waiting for out-of-band delivery"
                );
                let code = self
                    .two_factor
                    .wait_for_code(self.two_factor_wait)
                    .await
                    .ok_or_else(|| {
                        PipelineError::Auth(format!(
                            "no two-factor code arrived within {}s",
                            self.two_factor_wait.as_secs()
                        ))
                    })?;
                if self.client.submit_code(&code).await? {
                    Ok(())
                } else {
                    Err(PipelineError::Auth("two-factor code rejected".to_string()))
                }
            }
        }
    }
}

#[async_trait]
impl IngestSource for ICloudIngest {
    fn tag(&self) -> IngestKind {
        IngestKind::ICloud
    }

    async fn discover(&self) -> PipelineResult<Vec<IngestItem>> {
        self.ensure_authenticated().await?;
        self.client.list_recent().await
    }

    async fn fetch(&self, item: &IngestItem) -> PipelineResult<PathBuf> {
        tokio::fs::create_dir_all(&self.originals_dir).await?;
        self.client.download(item, &self.originals_dir).await
    }
}
