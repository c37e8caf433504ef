use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{AlertChannel, Notification, NotifyError};
use crate::config::PushoverConfig;

const API_URL: &str = "https://api.pushover.net/1/messages.json";

/// Pushover user and group keys are at least this long.
pub const MIN_RECEIVER_LEN: usize = 10;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: i64,
    #[serde(default)]
    errors: Vec<String>,
}

pub struct PushoverClient {
    http: Client,
    app_token: String,
    receiver: String,
    api_url: String,
}

impl PushoverClient {
    pub fn new(http: Client, config: &PushoverConfig) -> Result<Self, NotifyError> {
        if config.receiver.len() < MIN_RECEIVER_LEN {
            return Err(NotifyError::Settings {
                service: "Pushover",
                reason: format!("receiver must be at least {MIN_RECEIVER_LEN} characters"),
            });
        }
        Ok(Self {
            http,
            app_token: config.app_token.clone(),
            receiver: config.receiver.clone(),
            api_url: API_URL.to_string(),
        })
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }
}

#[async_trait]
impl AlertChannel for PushoverClient {
    fn name(&self) -> &'static str {
        "pushover"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let form = [
            ("token", self.app_token.as_str()),
            ("user", self.receiver.as_str()),
            ("title", notification.title.as_str()),
            ("message", notification.text.as_str()),
        ];
        let resp: ApiResponse = self
            .http
            .post(&self.api_url)
            .form(&form)
            .send()
            .await?
            .json()
            .await?;

        if resp.status != 1 {
            return Err(NotifyError::Rejected {
                service: "Pushover",
                reason: format!("status {}: {}", resp.status, resp.errors.join("; ")),
            });
        }
        Ok(())
    }
}
