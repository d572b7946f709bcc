//! Outbound operator notifications.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Sink for operator-facing messages (gas cap reached, fatal exit).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) {
        warn!(notification = message, "Operator notification");
    }
}

/// Posts `{"text": message}` to a webhook (Slack/Discord compatible).
///
/// Delivery failures are logged and otherwise ignored.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) {
        LogNotifier.notify(message).await;

        let result = self
            .client
            .post(&self.url)
            .json(&json!({ "text": message }))
            .send()
            .await
            .and_then(|resp| resp.error_for_status());

        match result {
            Ok(_) => debug!("Webhook notification delivered"),
            Err(e) => warn!(error = %e, "Webhook notification failed"),
        }
    }
}
