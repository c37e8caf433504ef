use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{AlertChannel, Notification, NotifyError, Publisher};
use crate::config::TelegramConfig;

const API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    error_code: Option<i64>,
    description: Option<String>,
}

/// Channels are addressed by numeric id or by `@name`.
pub fn is_valid_channel(channel: &str) -> bool {
    let numeric = channel.strip_prefix('-').unwrap_or(channel);
    (!numeric.is_empty() && numeric.chars().all(|c| c.is_ascii_digit()))
        || (channel.len() > 1 && channel.starts_with('@'))
}

/// Bot API client posting to a single chat.
pub struct TelegramClient {
    http: Client,
    token: String,
    channel: String,
    api_base: String,
}

impl TelegramClient {
    pub fn new(http: Client, config: &TelegramConfig) -> Result<Self, NotifyError> {
        if config.token.is_empty() {
            return Err(NotifyError::Settings {
                service: "Telegram",
                reason: "empty bot token".into(),
            });
        }
        if !is_valid_channel(&config.channel) {
            return Err(NotifyError::Settings {
                service: "Telegram",
                reason: format!("channel must be numeric or start with '@', got {:?}", config.channel),
            });
        }
        Ok(Self {
            http,
            token: config.token.clone(),
            channel: config.channel.clone(),
            api_base: API_BASE.to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let resp: ApiResponse = self
            .http
            .post(url)
            .json(&json!({ "chat_id": self.channel, "text": text }))
            .send()
            .await?
            .json()
            .await?;

        if !resp.ok {
            return Err(NotifyError::Rejected {
                service: "Telegram",
                reason: format!(
                    "code {} - {}",
                    resp.error_code.unwrap_or_default(),
                    resp.description.unwrap_or_default()
                ),
            });
        }
        debug!(channel = %self.channel, "Telegram message sent");
        Ok(())
    }
}

#[async_trait]
impl Publisher for TelegramClient {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn publish(&self, message: &str) -> Result<(), NotifyError> {
        self.send_message(message).await
    }
}

#[async_trait]
impl AlertChannel for TelegramClient {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.send_message(&notification.messenger_text()).await
    }
}
