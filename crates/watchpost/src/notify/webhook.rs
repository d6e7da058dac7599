//! Webhook notification sink
//!
//! Posts `multipart/form-data` in the shape Discord-compatible webhooks
//! accept: a `payload_json` part with the message text and one `files[0]`
//! part with the artifact. Artifacts larger than the upload limit are
//! announced by file name only.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use reqwest::multipart::{Form, Part};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::NotificationSink;
use crate::NotifyError;

/// Webhook endpoint configuration
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    /// Largest file attached to a message
    pub max_upload_bytes: u64,
    pub connect_timeout: Duration,
    pub timeout: Duration,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_upload_bytes: 8 * 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct WebhookSink {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(config: WebhookConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .build()?;
        info!("Webhook notifications enabled");
        Ok(Self { config, client })
    }

    async fn post(&self, content: String, attachment: Option<&Path>) -> Result<(), NotifyError> {
        let mut form = Form::new().text("payload_json", json!({ "content": content }).to_string());

        if let Some(path) = attachment {
            if let Some(part) = self.file_part(path).await? {
                form = form.part("files[0]", part);
            }
        }

        let response = self
            .client
            .post(&self.config.url)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected(format!(
                "webhook returned {}: {}",
                status,
                body.trim()
            )));
        }

        debug!(%status, "Webhook accepted notification");
        Ok(())
    }

    /// Attachment part, or `None` when the file exceeds the upload limit
    async fn file_part(&self, path: &Path) -> Result<Option<Part>, NotifyError> {
        let artifact_err = |source| NotifyError::Artifact {
            path: path.to_path_buf(),
            source,
        };

        let len = tokio::fs::metadata(path).await.map_err(artifact_err)?.len();
        if len > self.config.max_upload_bytes {
            info!(
                bytes = len,
                limit = self.config.max_upload_bytes,
                "Artifact too large to attach: {:?}",
                path
            );
            return Ok(None);
        }

        let data = tokio::fs::read(path).await.map_err(artifact_err)?;
        let part = Part::bytes(data)
            .file_name(file_name(path))
            .mime_str(mime_for(path))?;
        Ok(Some(part))
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send_alert(&self, snapshot: &Path, at: DateTime<Local>) -> Result<(), NotifyError> {
        let content = format!(
            "⚠️ Motion Detected! Motion was detected at {}",
            at.format("%Y-%m-%d %H:%M:%S")
        );
        self.post(content, Some(snapshot)).await
    }

    async fn send_episode(&self, snapshot: Option<&Path>, clip: &Path) -> Result<(), NotifyError> {
        let content = format!(
            "Security event recorded. Snapshot: {}, clip: {}",
            snapshot.map_or_else(|| "unavailable".to_string(), file_name),
            file_name(clip)
        );
        self.post(content, Some(clip)).await
    }

    async fn send_last_frame(&self, snapshot: &Path) -> Result<(), NotifyError> {
        self.post("Last detected motion:".to_string(), Some(snapshot))
            .await
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string())
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}
