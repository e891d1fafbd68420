//! Pipeline notifications. Delivery problems are logged, never fatal to a step.

use std::time::Duration;

use async_trait::async_trait;
use jobflow_core::{JobflowError, Result};
use serde_json::json;

/// Thread all pipeline messages are posted under.
pub const NOTIFY_THREAD: &str = "MASTER BUILD";

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, reference_id: &str, message: &str) -> Result<()>;
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, reference_id: &str, message: &str) -> Result<()> {
        tracing::info!("📢 [{}] {}", reference_id, message);
        Ok(())
    }
}

/// POSTs each notification as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| JobflowError::Http(format!("client setup failed: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, reference_id: &str, message: &str) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({
                "thread": NOTIFY_THREAD,
                "referenceId": reference_id,
                "text": message,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }))
            .send()
            .await
            .map_err(|e| JobflowError::Http(format!("webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::debug!("webhook notification sent for {}", reference_id);
            Ok(())
        } else {
            Err(JobflowError::Http(format!("webhook error {}", resp.status())))
        }
    }
}

/// Send `message`, logging instead of failing when delivery breaks.
pub async fn announce(notifier: &dyn Notifier, reference_id: &str, message: &str) {
    if let Err(e) = notifier.notify(reference_id, message).await {
        tracing::warn!("⚠️ Notification for '{}' not delivered: {e}", reference_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        async fn notify(&self, _reference_id: &str, _message: &str) -> Result<()> {
            Err(JobflowError::Http("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_announce_swallows_delivery_errors() {
        announce(&Broken, "ref", "hello").await;
        announce(&LogNotifier, "ref", "hello").await;
    }
}
