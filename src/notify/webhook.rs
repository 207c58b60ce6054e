//! Webhook notifications.
//!
//! Sends lifecycle notifications as JSON text messages to a configured
//! webhook endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::Notifier;

/// Webhook notification client
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    webhook_url: String,
}

#[derive(Serialize)]
struct WebhookMessage {
    msg_type: String,
    content: WebhookContent,
}

#[derive(Serialize)]
struct WebhookContent {
    text: String,
}

impl WebhookNotifier {
    /// Create a new webhook notifier from environment variable
    pub fn from_env() -> Option<Arc<Self>> {
        std::env::var("STEWARD_WEBHOOK_URL").ok().map(|url| {
            info!("Webhook notifications enabled");
            Arc::new(Self {
                client: Client::new(),
                webhook_url: url,
            })
        })
    }

    /// Create a new webhook notifier with explicit URL
    pub fn new(webhook_url: String) -> Arc<Self> {
        Arc::new(Self {
            client: Client::new(),
            webhook_url,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, text: &str) -> Result<(), String> {
        let message = WebhookMessage {
            msg_type: "text".to_string(),
            content: WebhookContent {
                text: text.to_string(),
            },
        };

        match self
            .client
            .post(&self.webhook_url)
            .json(&message)
            .send()
            .await
        {
            Ok(resp) => {
                if resp.status().is_success() {
                    debug!("Webhook notification sent successfully");
                    Ok(())
                } else {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    error!("Webhook notification failed: {} - {}", status, body);
                    Err(format!("HTTP {}: {}", status, body))
                }
            }
            Err(e) => {
                error!("Webhook request failed: {}", e);
                Err(e.to_string())
            }
        }
    }
}
