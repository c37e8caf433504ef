use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use super::detector::SharedDetector;
use crate::notifications::AlertDispatcher;

/// Message shown before any notification has gone out.
pub const NEVER_NOTIFIED: &str = "never (connected)";

#[derive(Debug, Clone, PartialEq)]
pub struct LivenessConfig {
    /// Escalate once the last notification is older than this.
    pub stale_threshold: chrono::Duration,
    /// Period of the timer-driven staleness check.
    pub check_interval: Duration,
    /// Suppress repeat alerts until the next successful notification.
    pub alert_once_per_episode: bool,
}

/// Last successful outbound notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessState {
    #[serde(rename = "msg")]
    pub last_message: String,
    #[serde(rename = "when")]
    pub last_at: DateTime<Utc>,
    #[serde(skip)]
    escalated: bool,
}

impl LivenessState {
    /// Sentinel installed at startup so staleness is measured from process start.
    pub fn never_notified(now: DateTime<Utc>) -> Self {
        Self {
            last_message: NEVER_NOTIFIED.to_string(),
            last_at: now,
            escalated: false,
        }
    }

    pub fn record_notification(&mut self, message: String, at: DateTime<Utc>) {
        self.last_message = message;
        self.last_at = at;
        self.escalated = false;
    }

    pub fn is_sentinel(&self) -> bool {
        self.last_message == NEVER_NOTIFIED
    }
}

/// An escalation the watchdog decided to raise.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleNotice {
    pub last_message: String,
    pub last_at: DateTime<Utc>,
    pub silent_for: chrono::Duration,
}

impl StaleNotice {
    pub fn title(&self) -> String {
        "notifications stopped".to_string()
    }

    pub fn body(&self) -> String {
        format!(
            "Last notification: {} ago ({})",
            format_elapsed(self.silent_for),
            self.last_message
        )
    }
}

/// Decides when the notification path has gone quiet for too long.
#[derive(Debug, Clone)]
pub struct LivenessWatchdog {
    config: LivenessConfig,
}

impl LivenessWatchdog {
    pub fn new(config: LivenessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    pub fn is_stale(&self, state: &LivenessState, now: DateTime<Utc>) -> bool {
        now - state.last_at > self.config.stale_threshold
    }

    /// Returns a notice when an alert should go out for this check.
    ///
    /// Without `alert_once_per_episode` every check during a stale period
    /// escalates again.
    pub fn check_staleness(&self, state: &mut LivenessState, now: DateTime<Utc>) -> Option<StaleNotice> {
        if !self.is_stale(state, now) {
            return None;
        }
        if self.config.alert_once_per_episode && state.escalated {
            return None;
        }
        state.escalated = true;
        Some(StaleNotice {
            last_message: state.last_message.clone(),
            last_at: state.last_at,
            silent_for: now - state.last_at,
        })
    }
}

/// Runs the staleness check and hands escalations to the alert dispatcher.
#[derive(Clone)]
pub struct StaleGuard {
    detector: SharedDetector,
    alerts: Arc<AlertDispatcher>,
}

impl StaleGuard {
    pub fn new(detector: SharedDetector, alerts: Arc<AlertDispatcher>) -> Self {
        Self { detector, alerts }
    }

    /// Returns true when an alert was dispatched.
    pub async fn check(&self, now: DateTime<Utc>) -> bool {
        let Some(notice) = self.detector.check_staleness(now) else {
            return false;
        };
        warn!(
            last_at = %notice.last_at,
            silent_secs = notice.silent_for.num_seconds(),
            "Notification path is stale, escalating"
        );
        self.alerts.alert_stale(&notice.title(), &notice.body()).await;
        true
    }
}

fn format_elapsed(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    let (days, hours, minutes) = (secs / 86_400, secs % 86_400 / 3_600, secs % 3_600 / 60);
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m {}s", secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watchdog(once: bool) -> LivenessWatchdog {
        LivenessWatchdog::new(LivenessConfig {
            stale_threshold: chrono::Duration::hours(12),
            check_interval: Duration::from_secs(600),
            alert_once_per_episode: once,
        })
    }

    #[test]
    fn sentinel_is_well_defined() {
        let now = Utc::now();
        let state = LivenessState::never_notified(now);
        assert!(state.is_sentinel());
        assert_eq!(state.last_at, now);
        assert!(!watchdog(false).is_stale(&state, now));
    }

    #[test]
    fn stale_only_strictly_after_threshold() {
        let start = Utc::now();
        let state = LivenessState::never_notified(start);
        let wd = watchdog(false);
        assert!(!wd.is_stale(&state, start + chrono::Duration::hours(12)));
        assert!(wd.is_stale(&state, start + chrono::Duration::hours(12) + chrono::Duration::seconds(1)));
    }

    #[test]
    fn repeated_checks_escalate_repeatedly_by_default() {
        let start = Utc::now();
        let mut state = LivenessState::never_notified(start);
        let wd = watchdog(false);
        let later = start + chrono::Duration::hours(13);
        assert!(wd.check_staleness(&mut state, later).is_some());
        assert!(wd.check_staleness(&mut state, later).is_some());
    }

    #[test]
    fn once_per_episode_until_next_notification() {
        let start = Utc::now();
        let mut state = LivenessState::never_notified(start);
        let wd = watchdog(true);
        let later = start + chrono::Duration::hours(13);
        assert!(wd.check_staleness(&mut state, later).is_some());
        assert!(wd.check_staleness(&mut state, later).is_none());

        state.record_notification("whale".into(), later);
        assert!(!state.is_sentinel());
        let much_later = later + chrono::Duration::hours(13);
        assert!(wd.check_staleness(&mut state, much_later).is_some());
    }

    #[test]
    fn notice_describes_silence() {
        let start = Utc::now();
        let mut state = LivenessState::never_notified(start);
        let notice = watchdog(false)
            .check_staleness(&mut state, start + chrono::Duration::minutes(25 * 60 + 5))
            .unwrap();
        assert_eq!(notice.silent_for, chrono::Duration::minutes(25 * 60 + 5));
        assert_eq!(notice.body(), "Last notification: 1d 1h 5m ago (never (connected))");
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(chrono::Duration::seconds(75)), "1m 15s");
        assert_eq!(format_elapsed(chrono::Duration::minutes(125)), "2h 5m");
        assert_eq!(format_elapsed(chrono::Duration::seconds(-5)), "0m 0s");
    }
}
