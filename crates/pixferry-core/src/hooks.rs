//! Hooks for out-of-band channels
//!
//! Notification delivery and interactive 2FA entry live outside this codebase
//! (messaging bots, dashboards). The pipeline only depends on these trait
//! interfaces; external layers provide real implementations.

use async_trait::async_trait;
use std::time::Duration;

use crate::models::Severity;

/// Receives run-level status messages (final report, phase failures).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, severity: Severity, message: &str);
}

/// No-op implementation used when no channel is configured.
pub struct NoOpNotifier;

#[async_trait]
impl Notifier for NoOpNotifier {
    async fn notify(&self, _severity: Severity, _message: &str) {}
}

/// Supplies a two-factor authentication code during interactive source login.
///
/// The ingest adapter signals that a code is pending and waits up to the
/// configured window; `None` means nothing arrived in time and the fetch
/// fails with an auth error.
#[async_trait]
pub trait TwoFactorSource: Send + Sync {
    async fn wait_for_code(&self, timeout: Duration) -> Option<String>;
}

/// Always times out; used when no out-of-band channel is wired up.
pub struct NoTwoFactorSource;

#[async_trait]
impl TwoFactorSource for NoTwoFactorSource {
    async fn wait_for_code(&self, _timeout: Duration) -> Option<String> {
        None
    }
}
