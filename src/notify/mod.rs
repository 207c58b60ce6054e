//! Notification sinks.
//!
//! The engine emits typed events; a `Notifier` turns formatted text into an
//! outbound message. Delivery failures are logged and never propagate back
//! into order handling.

pub mod webhook;

use async_trait::async_trait;

pub use webhook::WebhookNotifier;

/// Outbound notification sink
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a text message; the error is a human-readable description
    async fn send(&self, text: &str) -> Result<(), String>;
}

/// Notifier that only logs, used when no webhook is configured
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) -> Result<(), String> {
        tracing::info!("notification: {}", text);
        Ok(())
    }
}
