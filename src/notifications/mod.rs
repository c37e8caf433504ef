pub mod desktop;
pub mod email;
pub mod message;
pub mod price;
pub mod pushover;
pub mod telegram;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::core::TransactionSummary;
use message::MessageComposer;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{service} rejected the message: {reason}")]
    Rejected { service: &'static str, reason: String },
    #[error("invalid price from {url}: {price}")]
    InvalidPrice { url: String, price: i64 },
    #[error("invalid {service} settings: {reason}")]
    Settings { service: &'static str, reason: String },
    #[error("desktop notification failed: {0}")]
    Desktop(String),
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("invalid email: {0}")]
    Mail(#[from] lettre::error::Error),
}

/// An operator-facing alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub text: String,
}

impl Notification {
    /// Titles carry the app name; empty bodies are replaced because some
    /// services (Pushover) refuse them.
    pub fn new(app_name: &str, title: &str, text: &str) -> Self {
        let text = if text.is_empty() { "empty text" } else { text };
        Self {
            title: format!("{app_name}: {title}"),
            text: text.to_string(),
        }
    }

    /// Title and body in one message, for chat services.
    pub fn messenger_text(&self) -> String {
        format!("{}:\n{}", self.title, self.text)
    }
}

/// Produces and delivers the public message for a notable transaction.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns the rendered message once it has been delivered.
    async fn notify(&self, tx: &TransactionSummary) -> Result<String, NotifyError>;
}

/// A destination for rendered whale messages.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &'static str;
    async fn publish(&self, message: &str) -> Result<(), NotifyError>;
}

/// A destination for operator alerts.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Renders a message and hands it to every publisher.
pub struct MessageNotifier {
    composer: MessageComposer,
    publishers: Vec<Box<dyn Publisher>>,
}

impl MessageNotifier {
    pub fn new(composer: MessageComposer, publishers: Vec<Box<dyn Publisher>>) -> Self {
        Self { composer, publishers }
    }
}

#[async_trait]
impl Notifier for MessageNotifier {
    async fn notify(&self, tx: &TransactionSummary) -> Result<String, NotifyError> {
        let message = self.composer.compose(tx).await?;
        for publisher in &self.publishers {
            publisher.publish(&message).await?;
        }
        Ok(message)
    }
}

/// Logs messages instead of posting them.
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn publish(&self, message: &str) -> Result<(), NotifyError> {
        info!(target: "whalewatch::publish", "{message}");
        Ok(())
    }
}

/// Fans operator alerts out to every configured channel.
pub struct AlertDispatcher {
    app_name: String,
    channels: Vec<Box<dyn AlertChannel>>,
}

impl AlertDispatcher {
    pub fn new(app_name: impl Into<String>, channels: Vec<Box<dyn AlertChannel>>) -> Self {
        Self {
            app_name: app_name.into(),
            channels,
        }
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Deliver to every channel. Failures are logged, never retried, and do
    /// not stop delivery to the remaining channels. Returns how many channels
    /// accepted the alert.
    pub async fn alert_stale(&self, title: &str, body: &str) -> usize {
        let notification = Notification::new(&self.app_name, title, body);
        if self.channels.is_empty() {
            warn!(title = %notification.title, "No alert channels configured: {}", notification.text);
            return 0;
        }

        let mut delivered = 0;
        for channel in &self.channels {
            match channel.send(&notification).await {
                Ok(()) => delivered += 1,
                Err(e) => error!(channel = channel.name(), "Failed to deliver alert: {e}"),
            }
        }
        delivered
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{RecordingChannel, RecordingPublisher};
    use super::*;
    use crate::core::policy::Verdict;

    fn summary() -> TransactionSummary {
        TransactionSummary {
            hash: "ab".repeat(32),
            amount: 12_345.6,
            fee: 0.0000226,
            block_height: 800_000,
            verdict: Verdict::Absolute,
        }
    }

    #[test]
    fn notification_prefixes_title_and_fills_empty_text() {
        let n = Notification::new("WhaleWatch", "notifications stopped", "");
        assert_eq!(n.title, "WhaleWatch: notifications stopped");
        assert_eq!(n.text, "empty text");
        assert_eq!(n.messenger_text(), "WhaleWatch: notifications stopped:\nempty text");
    }

    #[tokio::test]
    async fn dispatcher_continues_past_failing_channel() {
        let failing = RecordingChannel {
            fail: true,
            ..Default::default()
        };
        let working = RecordingChannel::default();
        let dispatcher = AlertDispatcher::new(
            "WhaleWatch",
            vec![Box::new(failing), Box::new(working.clone())],
        );

        let delivered = dispatcher.alert_stale("notifications stopped", "Last notification: 13h ago").await;
        assert_eq!(delivered, 1);
        let sent = working.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "WhaleWatch: notifications stopped");
    }

    #[tokio::test]
    async fn dispatcher_without_channels_delivers_nothing() {
        let dispatcher = AlertDispatcher::new("WhaleWatch", Vec::new());
        assert_eq!(dispatcher.alert_stale("t", "b").await, 0);
    }

    #[tokio::test]
    async fn notifier_returns_rendered_message_after_publishing() {
        let publisher = RecordingPublisher::default();
        let composer = MessageComposer::new("{amount} {symbol} {hash}", "BCH", "https://x/{hash}", "USD", None);
        let notifier = MessageNotifier::new(composer, vec![Box::new(publisher.clone())]);

        let message = notifier.notify(&summary()).await.unwrap();
        assert_eq!(message, format!("12,346 BCH {}", "ab".repeat(32)));
        assert_eq!(publisher.published.lock().as_slice(), &[message]);
    }

    #[tokio::test]
    async fn notifier_fails_when_a_publisher_fails() {
        let publisher = RecordingPublisher {
            fail: true,
            ..Default::default()
        };
        let composer = MessageComposer::new("{amount}", "BCH", "{hash}", "USD", None);
        let notifier = MessageNotifier::new(composer, vec![Box::new(publisher)]);
        assert!(notifier.notify(&summary()).await.is_err());
    }
}
