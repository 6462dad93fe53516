//! Minimal WebDriver protocol client.
//!
//! Speaks the W3C WebDriver wire protocol (JSON over HTTP) against a
//! chromedriver endpoint. Only the calls the uploader needs are implemented:
//! session lifecycle, navigation, element lookup, keyboard input into file
//! controls, script execution, cookies, and frame switching.

use serde_json::{json, Value};
use std::time::Duration;

use pixferry_core::{PipelineError, PipelineResult};

/// W3C element identifier key in element references.
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WebDriverClient {
    http: reqwest::Client,
    base_url: String,
    session_id: Option<String>,
}

impl WebDriverClient {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_id: None,
        }
    }

    pub fn has_session(&self) -> bool {
        self.session_id.is_some()
    }

    /// Open a browser session. `headless` controls whether a window shows;
    /// interactive login flows need a visible browser.
    pub async fn start_session(&mut self, headless: bool) -> PipelineResult<()> {
        let mut args = vec![
            "--disable-gpu".to_string(),
            "--no-first-run".to_string(),
            "--window-size=1280,960".to_string(),
        ];
        if headless {
            args.push("--headless=new".to_string());
        }
        let body = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args }
                }
            }
        });
        let value = self.raw_post(&format!("{}/session", self.base_url), &body).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::Media("webdriver returned no session id".to_string()))?;
        self.session_id = Some(session_id.to_string());
        tracing::debug!(session_id, "webdriver session started");
        Ok(())
    }

    pub async fn quit(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            let url = format!("{}/session/{}", self.base_url, session_id);
            if let Err(e) = self.http.delete(&url).send().await {
                tracing::debug!(error = %e, "webdriver session delete failed");
            }
        }
    }

    pub async fn navigate(&self, url: &str) -> PipelineResult<()> {
        self.session_post("url", &json!({ "url": url })).await?;
        Ok(())
    }

    pub async fn current_url(&self) -> PipelineResult<String> {
        let value = self.session_get("url").await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PipelineError::Media("current url is not a string".to_string()))
    }

    /// First element matching the CSS selector in the current browsing
    /// context, or `None` when nothing matches.
    pub async fn find_element(&self, css: &str) -> PipelineResult<Option<String>> {
        let body = json!({ "using": "css selector", "value": css });
        match self.session_post("element", &body).await {
            Ok(value) => Ok(element_id(&value)),
            Err(PipelineError::Media(msg)) if msg.contains("no such element") => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn find_elements(&self, css: &str) -> PipelineResult<Vec<String>> {
        let body = json!({ "using": "css selector", "value": css });
        let value = self.session_post("elements", &body).await?;
        Ok(value
            .as_array()
            .map(|refs| refs.iter().filter_map(element_id).collect())
            .unwrap_or_default())
    }

    /// Type text into an element. For `<input type=file>` the text is the
    /// absolute file path to attach.
    pub async fn send_keys(&self, element_id: &str, text: &str) -> PipelineResult<()> {
        let path = format!("element/{}/value", element_id);
        let body = json!({ "text": text });
        self.session_post(&path, &body).await?;
        Ok(())
    }

    /// Execute synchronous script in the page; returns its result value.
    pub async fn execute(&self, script: &str, args: Vec<Value>) -> PipelineResult<Value> {
        let body = json!({ "script": script, "args": args });
        self.session_post("execute/sync", &body).await
    }

    pub async fn cookies(&self) -> PipelineResult<Vec<Value>> {
        let value = self.session_get("cookie").await?;
        Ok(value.as_array().cloned().unwrap_or_default())
    }

    pub async fn add_cookie(&self, cookie: &Value) -> PipelineResult<()> {
        self.session_post("cookie", &json!({ "cookie": cookie })).await?;
        Ok(())
    }

    /// Switch into the nth child frame; `None` returns to the top-level
    /// browsing context.
    pub async fn switch_to_frame(&self, index: Option<u32>) -> PipelineResult<()> {
        let id = match index {
            Some(n) => json!(n),
            None => Value::Null,
        };
        self.session_post("frame", &json!({ "id": id })).await?;
        Ok(())
    }

    /// Number of child frames in the current browsing context.
    pub async fn frame_count(&self) -> PipelineResult<u32> {
        let value = self.execute("return window.frames.length;", Vec::new()).await?;
        Ok(value.as_u64().unwrap_or(0) as u32)
    }

    fn session_id(&self) -> PipelineResult<&str> {
        self.session_id
            .as_deref()
            .ok_or_else(|| PipelineError::Media("no webdriver session".to_string()))
    }

    async fn session_post(&self, path: &str, body: &Value) -> PipelineResult<Value> {
        let url = format!("{}/session/{}/{}", self.base_url, self.session_id()?, path);
        self.raw_post(&url, body).await
    }

    async fn session_get(&self, path: &str) -> PipelineResult<Value> {
        let url = format!("{}/session/{}/{}", self.base_url, self.session_id()?, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::Media(format!("webdriver request failed: {}", e)))?;
        unwrap_value(response).await
    }

    async fn raw_post(&self, url: &str, body: &Value) -> PipelineResult<Value> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| PipelineError::Media(format!("webdriver request failed: {}", e)))?;
        unwrap_value(response).await
    }
}

fn element_id(value: &Value) -> Option<String> {
    value
        .get(ELEMENT_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Unwrap the protocol envelope: success bodies are `{"value": ...}`,
/// errors are `{"value": {"error": ..., "message": ...}}` with a non-2xx
/// status.
async fn unwrap_value(response: reqwest::Response) -> PipelineResult<Value> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| PipelineError::Media(format!("webdriver response not json: {}", e)))?;
    let value = body.get("value").cloned().unwrap_or(Value::Null);
    if status.is_success() {
        Ok(value)
    } else {
        let error = value.get("error").and_then(Value::as_str).unwrap_or("unknown");
        let message = value.get("message").and_then(Value::as_str).unwrap_or("");
        Err(PipelineError::Media(format!(
            "webdriver error: {} {}",
            error, message
        )))
    }
}
