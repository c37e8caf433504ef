use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AlertChannel, Notification, NotifyError};

/// Desktop alerts with a cooldown to prevent spam.
pub struct DesktopChannel {
    cooldown: Duration,
    last_sent: Arc<Mutex<Option<Instant>>>,
}

impl DesktopChannel {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sent: Arc::new(Mutex::new(None)),
        }
    }

    /// Check and update cooldown. Returns true if enough time has passed.
    fn check_cooldown(&self) -> bool {
        let mut last = self.last_sent.lock();
        let now = Instant::now();
        if let Some(prev) = *last {
            if now.duration_since(prev) < self.cooldown {
                return false;
            }
        }
        *last = Some(now);
        true
    }
}

#[async_trait]
impl AlertChannel for DesktopChannel {
    fn name(&self) -> &'static str {
        "desktop"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        if !self.check_cooldown() {
            tracing::debug!("Desktop alert suppressed by cooldown");
            return Ok(());
        }

        let title = format!("🐳 {}", notification.title);
        let body = notification.text.clone();
        // show() blocks on the session bus
        tokio::task::spawn_blocking(move || {
            notify_rust::Notification::new()
                .summary(&title)
                .body(&body)
                .show()
                .map(|_| ())
                .map_err(|e| NotifyError::Desktop(e.to_string()))
        })
        .await
        .map_err(|e| NotifyError::Desktop(e.to_string()))?
    }
}
