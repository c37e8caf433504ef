use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::liveness::LivenessConfig;
use crate::core::policy::ThresholdConfig;
use crate::notifications::email::parse_receivers;
use crate::notifications::message::DEFAULT_TEMPLATE;
use crate::notifications::pushover::MIN_RECEIVER_LEN;
use crate::notifications::telegram::is_valid_channel;
use crate::stream::StreamConfig;

pub const DEFAULT_PATH: &str = "config.toml";
pub const PATH_ENV: &str = "WHALEWATCH_CONFIG";

/// Upper bound for hour-based settings (ten years).
pub const MAX_HOURS: u64 = 24 * 365 * 10;
/// Upper bound for minute-based settings (one year).
pub const MAX_MINUTES: u64 = 60 * 24 * 365;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse {}: {source}", path.display())]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub log: LogConfig,
    pub node: NodeConfig,
    pub stream: StreamSettings,
    pub threshold: ThresholdSettings,
    pub liveness: LivenessSettings,
    pub persistence: PersistenceConfig,
    pub message: MessageConfig,
    pub publish: PublishConfig,
    pub alerts: AlertsConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NodeConfig {
    pub rpc_host: String,
    pub rpc_port: u16,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub zmq_hashblock: String,
    pub request_timeout_secs: u64,
    /// Reconnect when no block has arrived for this long.
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StreamSettings {
    pub reconnect_delay_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ThresholdSettings {
    pub absolute_threshold: f64,
    pub minimum_sample_count: usize,
    /// Percent of the window, `(0, 100]`.
    pub upper_percentile: f64,
    pub retention_hours: u64,
    pub prune_interval_minutes: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LivenessSettings {
    pub stale_threshold_hours: u64,
    pub check_interval_minutes: u64,
    pub alert_once_per_episode: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnCorrupt {
    /// Refuse to start.
    #[default]
    Fail,
    /// Move the bad snapshot aside and start with an empty window.
    StartEmpty,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PersistenceConfig {
    pub path: PathBuf,
    pub on_corrupt: OnCorrupt,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MessageConfig {
    pub template: String,
    pub symbol: String,
    /// Link template; `{hash}` is replaced by the transaction hash.
    pub block_explorer: String,
    pub fiat_currency: String,
    pub price_api_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TelegramConfig {
    pub token: String,
    pub channel: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PushoverConfig {
    pub app_token: String,
    pub receiver: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EmailConfig {
    pub smtp_host: String,
    /// Implicit TLS port.
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub allow_self_signed: bool,
    pub from_address: String,
    pub from_password: String,
    /// Comma-separated list.
    pub receivers: String,
}

fn default_smtp_port() -> u16 {
    465
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PublishConfig {
    /// Log messages instead of posting them.
    pub dry_run: bool,
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertsConfig {
    pub desktop: bool,
    pub desktop_cooldown_secs: u64,
    pub telegram: Option<TelegramConfig>,
    pub pushover: Option<PushoverConfig>,
    pub email: Option<EmailConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub listen: SocketAddr,
    pub path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "WhaleWatch".into(),
            shutdown_timeout_secs: 10,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "whalewatch=info".into(),
            json: false,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_host: "127.0.0.1".into(),
            rpc_port: 8332,
            rpc_user: None,
            rpc_password: None,
            zmq_hashblock: "tcp://127.0.0.1:28332".into(),
            request_timeout_secs: 30,
            idle_timeout_secs: 3600,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 10,
        }
    }
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self {
            absolute_threshold: 10_000.0,
            minimum_sample_count: 1000,
            upper_percentile: 0.5,
            retention_hours: 24,
            prune_interval_minutes: 30,
        }
    }
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            stale_threshold_hours: 12,
            check_interval_minutes: 10,
            alert_once_per_episode: false,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: "data/tx_history.db".into(),
            on_corrupt: OnCorrupt::Fail,
        }
    }
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.into(),
            symbol: "BCH".into(),
            block_explorer: "https://blockchair.com/bitcoin-cash/transaction/{hash}".into(),
            fiat_currency: "USD".into(),
            price_api_url: None,
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            telegram: None,
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            desktop: false,
            desktop_cooldown_secs: 60,
            telegram: None,
            pushover: None,
            email: None,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            path: "/monitoring".into(),
        }
    }
}

impl Config {
    /// Config path from the first CLI argument, then the environment.
    pub fn resolve_path(arg: Option<String>) -> PathBuf {
        arg.or_else(|| std::env::var(PATH_ENV).ok())
            .unwrap_or_else(|| DEFAULT_PATH.to_string())
            .into()
    }

    /// Load and validate config from a TOML file. Falls back to defaults if
    /// the file doesn't exist; any other problem is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.threshold;
        if !t.absolute_threshold.is_finite() || t.absolute_threshold <= 0.0 {
            return Err(invalid("threshold.absolute_threshold", "must be a positive number"));
        }
        if !(t.upper_percentile > 0.0 && t.upper_percentile <= 100.0) {
            return Err(invalid("threshold.upper_percentile", "must be in (0, 100]"));
        }

        for (key, value) in [
            ("threshold.retention_hours", t.retention_hours),
            ("threshold.prune_interval_minutes", t.prune_interval_minutes),
            ("stream.reconnect_delay_secs", self.stream.reconnect_delay_secs),
            ("liveness.stale_threshold_hours", self.liveness.stale_threshold_hours),
            ("liveness.check_interval_minutes", self.liveness.check_interval_minutes),
            ("node.idle_timeout_secs", self.node.idle_timeout_secs),
            ("node.request_timeout_secs", self.node.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(invalid(key, "must be greater than zero"));
            }
        }

        for (key, value, max) in [
            ("threshold.retention_hours", t.retention_hours, MAX_HOURS),
            ("liveness.stale_threshold_hours", self.liveness.stale_threshold_hours, MAX_HOURS),
            ("threshold.prune_interval_minutes", t.prune_interval_minutes, MAX_MINUTES),
            ("liveness.check_interval_minutes", self.liveness.check_interval_minutes, MAX_MINUTES),
        ] {
            if value > max {
                return Err(invalid(key, format!("must be at most {max}")));
            }
        }

        if self.message.template.trim().is_empty() {
            return Err(invalid("message.template", "must not be empty"));
        }
        if !self.status.path.starts_with('/') {
            return Err(invalid("status.path", "must start with '/'"));
        }

        if let Some(tg) = &self.publish.telegram {
            if !is_valid_channel(&tg.channel) {
                return Err(invalid("publish.telegram.channel", "must be numeric or start with '@'"));
            }
        }
        if let Some(tg) = &self.alerts.telegram {
            if !is_valid_channel(&tg.channel) {
                return Err(invalid("alerts.telegram.channel", "must be numeric or start with '@'"));
            }
        }
        if let Some(po) = &self.alerts.pushover {
            if po.receiver.len() < MIN_RECEIVER_LEN {
                return Err(invalid(
                    "alerts.pushover.receiver",
                    format!("must be at least {MIN_RECEIVER_LEN} characters"),
                ));
            }
        }
        if let Some(email) = &self.alerts.email {
            if email.smtp_host.trim().is_empty() {
                return Err(invalid("alerts.email.smtp_host", "must not be empty"));
            }
            if let Err(e) = email.from_address.parse::<lettre::message::Mailbox>() {
                return Err(invalid("alerts.email.from_address", e.to_string()));
            }
            if let Err(e) = parse_receivers(&email.receivers) {
                return Err(invalid("alerts.email.receivers", e.to_string()));
            }
        }
        if !self.publish.dry_run && self.publish.telegram.is_none() {
            return Err(invalid("publish.dry_run", "is false but no publisher is configured"));
        }
        Ok(())
    }

    pub fn threshold_config(&self) -> ThresholdConfig {
        let t = &self.threshold;
        ThresholdConfig {
            absolute_threshold: t.absolute_threshold,
            minimum_sample_count: t.minimum_sample_count,
            upper_percentile: t.upper_percentile,
            retention: chrono::Duration::hours(t.retention_hours as i64),
            prune_interval: Duration::from_secs(t.prune_interval_minutes * 60),
        }
    }

    pub fn liveness_config(&self) -> LivenessConfig {
        let l = &self.liveness;
        LivenessConfig {
            stale_threshold: chrono::Duration::hours(l.stale_threshold_hours as i64),
            check_interval: Duration::from_secs(l.check_interval_minutes * 60),
            alert_once_per_episode: l.alert_once_per_episode,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            reconnect_delay: Duration::from_secs(self.stream.reconnect_delay_secs),
            idle_timeout: Some(Duration::from_secs(self.node.idle_timeout_secs)),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.app.shutdown_timeout_secs)
    }
}
