use std::sync::Arc;
use std::time::Duration;

use log::*;
use reqwest::Client;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::GotifyConfig;

pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);
pub const ERROR_PRIORITY: u8 = 6;

/// A Gotify message, sent as a form body.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub priority: u8,
}

impl Notification {
    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Notification {
            title: title.into(),
            message: message.into(),
            priority: ERROR_PRIORITY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error("Http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Notification rejected with status: {0}")]
    Status(u16),
    #[error("Notification timed out")]
    Timeout,
}

/// Best-effort push notifications. A notifier without Gotify config does nothing.
#[derive(Clone)]
pub struct Notifier {
    gotify: Option<Arc<Gotify>>,
}

struct Gotify {
    client: Client,
    config: GotifyConfig,
}

impl Notifier {
    pub fn new(config: Option<GotifyConfig>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(config, NOTIFY_TIMEOUT)
    }

    pub fn with_timeout(
        config: Option<GotifyConfig>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let Some(config) = config else {
            return Ok(Self::disabled());
        };
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Notifier {
            gotify: Some(Arc::new(Gotify { client, config })),
        })
    }

    pub fn disabled() -> Self {
        Notifier { gotify: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.gotify.is_some()
    }

    /// Returns `Ok(false)` when notifications are disabled.
    pub async fn send(&self, notification: &Notification) -> Result<bool, NotifierError> {
        let Some(gotify) = &self.gotify else {
            return Ok(false);
        };
        let response = gotify
            .client
            .post(&gotify.config.url)
            .query(&[("token", &gotify.config.token)])
            .form(notification)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotifierError::Timeout
                } else {
                    NotifierError::Http(e)
                }
            })?;
        if !response.status().is_success() {
            return Err(NotifierError::Status(response.status().as_u16()));
        }
        Ok(true)
    }

    pub async fn notify(&self, notification: Notification) {
        match self.send(&notification).await {
            Ok(true) => debug!("Gotify notification sent: {}", notification.title),
            Ok(false) => warn!("Gotify is not configured, skipping notification: {}", notification.title),
            Err(e) => warn!("Failed to send Gotify notification: {e}"),
        }
    }

    /// Delivers the notification on a background task. Callers may drop the handle.
    pub fn notify_detached(&self, notification: Notification) -> JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move { notifier.notify(notification).await })
    }
}
