//! Browser-automated cloud photo uploader.
//!
//! Drives a chromedriver-controlled browser through the photo service's web
//! UI. Session cookies persist across runs in a JSON jar; the upload control
//! is located through a three-step selector resolution (config override,
//! bundled candidate list, frame walk) bounded by the upload timeout.

use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::Value;

use pixferry_core::models::{
    BatchStatus, FileStatus, PhaseName, PhaseOutcome, Severity, UploadKind,
};
use pixferry_core::{ICloudPolicy, PipelineError, PipelineResult};
use pixferry_db::FileUpdate;

use super::selectors::candidate_selectors;
use super::webdriver::WebDriverClient;
use super::{bridge_entries, finish_upload, map_bridge_entry};
use crate::context::PipelineContext;
use crate::stage::BridgeLock;

const HOME_URL: &str = "https://www.icloud.com/";
const PHOTOS_URL: &str = "https://www.icloud.com/photos/";
const READY_POLL: Duration = Duration::from_secs(2);
const COMPLETION_POLL: Duration = Duration::from_secs(2);
const INTERACTIVE_LOGIN_WAIT: Duration = Duration::from_secs(600);

/// Script probing whether the photos app finished loading.
const READY_SCRIPT: &str = "return document.readyState === 'complete' \
     && window.location.href.indexOf('/photos') !== -1;";

/// Script probing upload completion: every progress element reports 100%
/// and no busy indicator remains.
const COMPLETION_SCRIPT: &str = "\
    var bars = document.querySelectorAll(\"progress, [role='progressbar']\");\n\
    for (var i = 0; i < bars.length; i++) {\n\
        var now = bars[i].getAttribute('aria-valuenow');\n\
        if (now === null && bars[i].value !== undefined) { now = bars[i].value; }\n\
        if (now !== null && Number(now) < 100) { return false; }\n\
    }\n\
    return document.querySelector(\"[aria-busy='true'], .uploading, .upload-progress\") === null;";

/// Where the upload control was found.
enum ResolvedControl {
    /// Element in the top-level browsing context.
    TopLevel(String),
    /// Element inside child frame `index`; the browser is left switched
    /// into that frame.
    InFrame { index: u32, element: String },
}

pub struct ICloudUploadPhase {
    /// List detected selectors and exit without uploading.
    pub inspect: bool,
}

impl ICloudUploadPhase {
    pub async fn run(&self, ctx: &PipelineContext) -> PhaseOutcome {
        let mut outcome = PhaseOutcome::new(PhaseName::UploadICloud);
        let start = Instant::now();
        let policy = &ctx.config.icloud;
        let bridge_dir = ctx.config.paths.bridge_icloud_dir.clone();

        let entries = match bridge_entries(&bridge_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                outcome.started = false;
                outcome.error = Some(e.to_string());
                outcome.duration = start.elapsed();
                return outcome;
            }
        };
        if entries.is_empty() && !self.inspect {
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

        let mut client = WebDriverClient::new(&policy.webdriver_url);
        if let Err(e) = self.open_photos(ctx, &mut client, policy).await {
            client.quit().await;
            ctx.log(
                PhaseName::UploadICloud,
                Severity::Error,
                &format!("cannot reach photos UI: {}", e),
            )
            .await;
            outcome.started = false;
            outcome.error = Some(e.to_string());
            outcome.duration = start.elapsed();
            return outcome;
        }

        if self.inspect {
            if let Err(e) = self.inspect_selectors(ctx, &client, policy).await {
                outcome.error = Some(e.to_string());
            }
            client.quit().await;
            outcome.skipped = entries.len() as u64;
            outcome.duration = start.elapsed();
            return outcome;
        }

        let batch = match ctx.store.latest_open_batch(UploadKind::ICloud).await {
            Ok(batch) => batch,
            Err(e) => {
                client.quit().await;
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

        for entry in entries {
            if ctx.cancel.is_cancelled() {
                break;
            }
            outcome.processed += 1;
            let file = match map_bridge_entry(ctx, &entry).await {
                Ok(Some(file)) => file,
                Ok(None) => {
                    outcome.skipped += 1;
                    tracing::warn!(entry = %entry.display(), "untracked bridge entry, leaving in place");
                    continue;
                }
                Err(e) => {
                    outcome.failed += 1;
                    ctx.log(
                        PhaseName::UploadICloud,
                        Severity::Error,
                        &format!("{}: {}", entry.display(), e),
                    )
                    .await;
                    continue;
                }
            };

            match self.upload_with_retries(ctx, &client, policy, &entry).await {
                Ok(()) => match finish_upload(ctx, UploadKind::ICloud, &entry, &file).await {
                    Ok(()) => {
                        outcome.succeeded += 1;
                        tracing::info!(file_id = %file.id, filename = %file.filename, "uploaded");
                    }
                    Err(e) => {
                        outcome.failed += 1;
                        ctx.log(
                            PhaseName::UploadICloud,
                            Severity::Error,
                            &format!("{}: post-upload move failed: {}", file.filename, e),
                        )
                        .await;
                    }
                },
                Err(e) => {
                    outcome.failed += 1;
                    let _ = ctx
                        .store
                        .update_file_status(file.id, FileStatus::Error, FileUpdate::default())
                        .await;
                    ctx.log(
                        PhaseName::UploadICloud,
                        Severity::Error,
                        &format!("{}: {}", file.filename, e),
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

        client.quit().await;
        outcome.duration = start.elapsed();
        outcome
    }

    /// Start the browser, restore or establish a session, and wait for the
    /// photos app. Cookies are persisted back once the app is reachable.
    async fn open_photos(
        &self,
        ctx: &PipelineContext,
        client: &mut WebDriverClient,
        policy: &ICloudPolicy,
    ) -> PipelineResult<()> {
        client.start_session(policy.headless).await?;
        client.navigate(HOME_URL).await?;

        let restored = match load_cookie_jar(&policy.session_file).await? {
            Some(cookies) => {
                for cookie in &cookies {
                    if let Err(e) = client.add_cookie(cookie).await {
                        tracing::debug!(error = %e, "cookie rejected");
                    }
                }
                true
            }
            None => false,
        };

        client.navigate(PHOTOS_URL).await?;
        let wait = if restored {
            Duration::from_secs(policy.upload_timeout_secs)
        } else if policy.headless {
            // No session and no window to log in through.
            return Err(PipelineError::Auth(
                "no stored session; run with PUPPETEER_HEADLESS=false to log in".to_string(),
            ));
        } else {
            ctx.log(
                PhaseName::UploadICloud,
                Severity::Info,
                "no stored session, waiting for interactive login",
            )
            .await;
            INTERACTIVE_LOGIN_WAIT
        };

        self.wait_for_ready(client, wait).await?;
        let cookies = client.cookies().await?;
        save_cookie_jar(&policy.session_file, &cookies).await?;
        Ok(())
    }

    async fn wait_for_ready(
        &self,
        client: &WebDriverClient,
        wait: Duration,
    ) -> PipelineResult<()> {
        let deadline = Instant::now() + wait;
        loop {
            let ready = client
                .execute(READY_SCRIPT, Vec::new())
                .await
                .map(|v| v.as_bool().unwrap_or(false))
                .unwrap_or(false);
            if ready {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PipelineError::Auth(format!(
                    "photos app not ready within {}s",
                    wait.as_secs()
                )));
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// One upload attempt per selector-resolution pass, retried per policy:
    /// at most `retry_attempts + 1` resolutions per file.
    async fn upload_with_retries(
        &self,
        ctx: &PipelineContext,
        client: &WebDriverClient,
        policy: &ICloudPolicy,
        path: &Path,
    ) -> PipelineResult<()> {
        let mut last_error = None;
        for attempt in 0..=policy.retry_attempts {
            if ctx.cancel.is_cancelled() {
                break;
            }
            match self.upload_once(client, policy, path).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = policy.retry_attempts + 1,
                        path = %path.display(),
                        error = %e,
                        "upload attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < policy.retry_attempts {
                        tokio::time::sleep(Duration::from_secs(policy.retry_delay_secs)).await;
                    }
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| PipelineError::Media("upload cancelled".to_string())))
    }

    async fn upload_once(
        &self,
        client: &WebDriverClient,
        policy: &ICloudPolicy,
        path: &Path,
    ) -> PipelineResult<()> {
        let control = self.resolve_control(client, policy).await?;
        let element = match &control {
            ResolvedControl::TopLevel(element) => element,
            ResolvedControl::InFrame { index, element } => {
                tracing::debug!(frame = *index, "upload control found inside child frame");
                element
            }
        };

        let absolute = path
            .to_str()
            .ok_or_else(|| PipelineError::Media(format!("non-utf8 path: {}", path.display())))?;
        let pushed = client.send_keys(element, absolute).await;

        // Always return to the top-level context before polling completion.
        if matches!(control, ResolvedControl::InFrame { .. }) {
            let _ = client.switch_to_frame(None).await;
        }
        pushed?;

        self.wait_for_completion(client, policy.upload_timeout_secs)
            .await
    }

    /// Selector resolution order: the configured override, the candidate
    /// list, then a walk of child frames looking for a file input. The whole
    /// pass shares one deadline.
    async fn resolve_control(
        &self,
        client: &WebDriverClient,
        policy: &ICloudPolicy,
    ) -> PipelineResult<ResolvedControl> {
        let deadline = Instant::now() + Duration::from_secs(policy.upload_timeout_secs);
        let mut attempted = 0usize;

        if let Some(selector) = &policy.selector_override {
            attempted += 1;
            if let Some(element) = client.find_element(selector).await? {
                return Ok(ResolvedControl::TopLevel(element));
            }
            tracing::debug!(selector = %selector, "override selector did not match");
        }

        for selector in candidate_selectors(&policy.session_file) {
            if Instant::now() >= deadline {
                break;
            }
            attempted += 1;
            if let Some(element) = client.find_element(&selector).await? {
                return Ok(ResolvedControl::TopLevel(element));
            }
        }

        let frames = client.frame_count().await.unwrap_or(0);
        for index in 0..frames {
            if Instant::now() >= deadline {
                break;
            }
            attempted += 1;
            client.switch_to_frame(Some(index)).await?;
            if let Some(element) = client.find_element("input[type='file']").await? {
                return Ok(ResolvedControl::InFrame { index, element });
            }
            client.switch_to_frame(None).await?;
        }

        Err(PipelineError::SelectorNotFound {
            attempted,
            timeout_secs: policy.upload_timeout_secs,
        })
    }

    async fn wait_for_completion(
        &self,
        client: &WebDriverClient,
        timeout_secs: u64,
    ) -> PipelineResult<()> {
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            let done = client
                .execute(COMPLETION_SCRIPT, Vec::new())
                .await
                .map(|v| v.as_bool().unwrap_or(false))
                .unwrap_or(false);
            if done {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PipelineError::UploadTimeout(timeout_secs));
            }
            tokio::time::sleep(COMPLETION_POLL).await;
        }
    }

    /// Inspect mode: enumerate every candidate the page currently matches,
    /// in every frame, and report without uploading.
    async fn inspect_selectors(
        &self,
        ctx: &PipelineContext,
        client: &WebDriverClient,
        policy: &ICloudPolicy,
    ) -> PipelineResult<()> {
        let mut findings = Vec::new();
        let mut candidates = Vec::new();
        if let Some(selector) = &policy.selector_override {
            candidates.push(selector.clone());
        }
        candidates.extend(candidate_selectors(&policy.session_file));

        for selector in &candidates {
            let matches = client.find_elements(selector).await?.len();
            if matches > 0 {
                findings.push(format!("{} ({} matches)", selector, matches));
            }
        }
        let frames = client.frame_count().await.unwrap_or(0);
        for index in 0..frames {
            client.switch_to_frame(Some(index)).await?;
            let matches = client.find_elements("input[type='file']").await?.len();
            client.switch_to_frame(None).await?;
            if matches > 0 {
                findings.push(format!("frame {}: input[type='file'] ({} matches)", index, matches));
            }
        }

        if findings.is_empty() {
            ctx.log(
                PhaseName::UploadICloud,
                Severity::Warning,
                "inspect: no upload controls detected",
            )
            .await;
        }
        for finding in findings {
            ctx.log(
                PhaseName::UploadICloud,
                Severity::Info,
                &format!("inspect: {}", finding),
            )
            .await;
        }
        Ok(())
    }
}

async fn load_cookie_jar(path: &Path) -> PipelineResult<Option<Vec<Value>>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => {
            let cookies: Vec<Value> = serde_json::from_str(&raw)
                .map_err(|e| PipelineError::Media(format!("malformed session file: {}", e)))?;
            Ok(Some(cookies))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn save_cookie_jar(path: &Path, cookies: &[Value]) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(cookies)?;
    tokio::fs::write(path, raw).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cookie_jar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("session.json");
        assert!(load_cookie_jar(&jar).await.unwrap().is_none());

        let cookies = vec![serde_json::json!({
            "name": "X-APPLE-SESSION",
            "value": "abc",
            "domain": ".icloud.com"
        })];
        save_cookie_jar(&jar, &cookies).await.unwrap();

        let loaded = load_cookie_jar(&jar).await.unwrap().unwrap();
        assert_eq!(loaded, cookies);
    }

    #[tokio::test]
    async fn test_malformed_cookie_jar_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("session.json");
        tokio::fs::write(&jar, "{{{{").await.unwrap();
        assert!(load_cookie_jar(&jar).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_bridge_is_a_quiet_noop() {
        let (ctx, _guard) = crate::context::tests::test_context().await;
        let outcome = ICloudUploadPhase { inspect: false }.run(&ctx).await;
        assert!(outcome.started);
        assert_eq!(outcome.processed, 0);
        assert_eq!(outcome.failed, 0);
    }
}
