//! Email notification sink
//!
//! Mails every finished episode over SMTP with the snapshot attached. The
//! clip is referenced in the body by path, or by URL when the clips are
//! published under `clip_url_base`. Alerts and last-frame requests go to
//! the faster channels only.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::NotificationSink;
use crate::NotifyError;

/// SMTP submission port
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// SMTP relay and message configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub host: String,
    pub port: u16,
    /// Upgrade with STARTTLS; turn off only for a local relay
    pub starttls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    /// URL prefix the clip file name is appended to
    pub clip_url_base: Option<String>,
    pub timeout: Duration,
}

impl EmailConfig {
    pub fn new(host: impl Into<String>, from: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SMTP_PORT,
            starttls: true,
            username: None,
            password: None,
            from: from.into(),
            to,
            subject: "Security event recorded".to_string(),
            clip_url_base: None,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct EmailSink {
    config: EmailConfig,
    from: Mailbox,
    to: Vec<Mailbox>,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailSink {
    pub fn new(config: EmailConfig) -> Result<Self, NotifyError> {
        let from = parse_mailbox(&config.from)?;
        let to = config
            .to
            .iter()
            .map(|addr| parse_mailbox(addr))
            .collect::<Result<Vec<_>, _>>()?;
        if to.is_empty() {
            return Err(NotifyError::Rejected("email sink has no recipients".to_string()));
        }

        let mut builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.host.as_str())
        };
        builder = builder.port(config.port).timeout(Some(config.timeout));
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        info!(
            host = %config.host,
            port = config.port,
            recipients = to.len(),
            "Email notifications enabled"
        );
        Ok(Self {
            transport: builder.build(),
            config,
            from,
            to,
        })
    }

    async fn episode_message(
        &self,
        snapshot: Option<&Path>,
        clip: &Path,
    ) -> Result<Message, NotifyError> {
        let clip_ref = match &self.config.clip_url_base {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), file_name(clip)),
            None => clip.display().to_string(),
        };
        let body = format!(
            "Motion has been detected!\n\nVideo clip: {}\nSnapshot: {}\n",
            clip_ref,
            if snapshot.is_some() { "attached" } else { "unavailable" }
        );

        let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(body));
        if let Some(path) = snapshot {
            let data = tokio::fs::read(path)
                .await
                .map_err(|source| NotifyError::Artifact {
                    path: path.to_path_buf(),
                    source,
                })?;
            let content_type = ContentType::parse("image/jpeg")
                .map_err(|e| NotifyError::Rejected(e.to_string()))?;
            parts = parts.singlepart(Attachment::new(file_name(path)).body(data, content_type));
        }

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(self.config.subject.as_str());
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        builder
            .multipart(parts)
            .map_err(|e| NotifyError::Rejected(format!("invalid email: {}", e)))
    }
}

#[async_trait]
impl NotificationSink for EmailSink {
    fn name(&self) -> &str {
        "email"
    }

    async fn send_alert(&self, _snapshot: &Path, _at: DateTime<Local>) -> Result<(), NotifyError> {
        debug!("Email sink skips alerts");
        Ok(())
    }

    async fn send_episode(&self, snapshot: Option<&Path>, clip: &Path) -> Result<(), NotifyError> {
        let message = self.episode_message(snapshot, clip).await?;
        let response = self.transport.send(message).await?;
        debug!(code = %response.code(), "SMTP relay accepted message");
        Ok(())
    }

    async fn send_last_frame(&self, _snapshot: &Path) -> Result<(), NotifyError> {
        debug!("Email sink skips last-frame requests");
        Ok(())
    }
}

fn parse_mailbox(addr: &str) -> Result<Mailbox, NotifyError> {
    addr.parse()
        .map_err(|e| NotifyError::Rejected(format!("invalid address {:?}: {}", addr, e)))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string())
}
