use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::liveness::{LivenessState, LivenessWatchdog, StaleNotice};
use super::policy::{ThresholdPolicy, Verdict};
use super::window::{Sample, WindowStore};

struct DetectorState {
    window: WindowStore,
    liveness: LivenessState,
}

/// Point-in-time statistics for the status exporter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub tx_count: usize,
    pub tx_avg: f64,
    pub tx_upper_percent: f64,
    pub last_notification: LivenessState,
}

/// The window and liveness state shared by the stream, maintenance and
/// watchdog tasks.
///
/// Every read and write goes through one mutex. Nothing here performs I/O
/// while holding it; callers that need to persist or dispatch take an owned
/// copy first.
#[derive(Clone)]
pub struct SharedDetector {
    inner: Arc<Mutex<DetectorState>>,
    policy: Arc<ThresholdPolicy>,
    watchdog: Arc<LivenessWatchdog>,
}

impl SharedDetector {
    pub fn new(policy: ThresholdPolicy, watchdog: LivenessWatchdog, samples: Vec<Sample>) -> Self {
        let window = WindowStore::with_samples(policy.config().retention, samples);
        Self {
            inner: Arc::new(Mutex::new(DetectorState {
                window,
                liveness: LivenessState::never_notified(Utc::now()),
            })),
            policy: Arc::new(policy),
            watchdog: Arc::new(watchdog),
        }
    }

    /// Record `size` and judge it against the window in one critical section.
    pub fn evaluate(&self, size: f64) -> Verdict {
        let mut state = self.inner.lock();
        self.policy.evaluate(&mut state.window, size)
    }

    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        self.inner.lock().window.prune(now)
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.inner.lock().window.snapshot()
    }

    /// Prune, then copy what is left, without letting a record slip in between.
    pub fn prune_and_snapshot(&self, now: DateTime<Utc>) -> (usize, Vec<Sample>) {
        let mut state = self.inner.lock();
        let removed = state.window.prune(now);
        (removed, state.window.snapshot())
    }

    pub fn count(&self) -> usize {
        self.inner.lock().window.count()
    }

    pub fn record_notification(&self, message: String, at: DateTime<Utc>) {
        self.inner.lock().liveness.record_notification(message, at);
    }

    pub fn liveness(&self) -> LivenessState {
        self.inner.lock().liveness.clone()
    }

    pub fn check_staleness(&self, now: DateTime<Utc>) -> Option<StaleNotice> {
        let mut state = self.inner.lock();
        self.watchdog.check_staleness(&mut state.liveness, now)
    }

    pub fn stats(&self) -> WindowStats {
        let state = self.inner.lock();
        WindowStats {
            tx_count: state.window.count(),
            tx_avg: state.window.average(),
            tx_upper_percent: self.policy.adaptive_threshold(&state.window),
            last_notification: state.liveness.clone(),
        }
    }
}
