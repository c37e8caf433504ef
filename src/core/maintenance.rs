use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::detector::SharedDetector;
use super::liveness::StaleGuard;
use crate::db::{SnapshotStore, StoreError};
use crate::shutdown::Shutdown;

/// Prune the window and persist what remains.
///
/// The copy is taken under the detector lock; the write happens after it is
/// released. Returns the number of samples saved.
pub async fn prune_and_save(detector: &SharedDetector, store: &SnapshotStore) -> Result<usize, StoreError> {
    let (removed, samples) = detector.prune_and_snapshot(Utc::now());
    let kept = samples.len();
    store.save_owned(samples).await?;
    info!(removed, kept, "Window snapshot saved");
    Ok(kept)
}

/// Periodic prune + snapshot until shutdown. Save failures are logged only.
pub async fn run_maintenance(detector: SharedDetector, store: SnapshotStore, interval: Duration, shutdown: Shutdown) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = prune_and_save(&detector, &store).await {
            error!(path = %store.path().display(), "Failed to save window snapshot: {e}");
        }
    }
    info!("Maintenance task stopped");
}

/// Timer-driven staleness check, so silence upstream still escalates.
pub async fn run_liveness_timer(guard: StaleGuard, interval: Duration, shutdown: Shutdown) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {}
        }
        guard.check(Utc::now()).await;
    }
    info!("Liveness timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::liveness::{LivenessConfig, LivenessWatchdog};
    use crate::core::policy::{ThresholdConfig, ThresholdPolicy};
    use crate::core::window::Sample;
    use crate::notifications::AlertDispatcher;
    use crate::notifications::testing::RecordingChannel;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing_test::traced_test;

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn store() -> SnapshotStore {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!("whalewatch_maint_{}_{}.db", std::process::id(), id));
        let _ = std::fs::remove_file(&path);
        SnapshotStore::open(&path).unwrap()
    }

    fn detector(samples: Vec<Sample>) -> SharedDetector {
        SharedDetector::new(
            ThresholdPolicy::new(ThresholdConfig {
                absolute_threshold: 1_000.0,
                minimum_sample_count: 10,
                upper_percentile: 1.0,
                retention: chrono::Duration::hours(1),
                prune_interval: Duration::from_millis(20),
            }),
            LivenessWatchdog::new(LivenessConfig {
                stale_threshold: chrono::Duration::hours(12),
                check_interval: Duration::from_millis(20),
                alert_once_per_episode: false,
            }),
            samples,
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn prune_and_save_drops_expired_samples() {
        let now = Utc::now();
        let detector = detector(vec![
            Sample::new(1.0, now - chrono::Duration::hours(2)),
            Sample::new(2.0, now),
        ]);
        let store = store();

        assert_eq!(prune_and_save(&detector, &store).await.unwrap(), 1);
        assert_eq!(store.load().unwrap(), vec![Sample::new(2.0, now)]);
        assert_eq!(detector.count(), 1);
        assert!(logs_contain("Window snapshot saved"));
        assert!(logs_contain("removed=1"));
    }

    #[tokio::test]
    async fn maintenance_saves_periodically_and_stops_on_shutdown() {
        let detector = detector(Vec::new());
        detector.evaluate(5.0);
        let store = store();
        let shutdown = Shutdown::new();

        let task = tokio::spawn(run_maintenance(
            detector.clone(),
            store.clone(),
            Duration::from_millis(20),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.load().unwrap(), detector.snapshot());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_timer_escalates_during_silence() {
        let detector = detector(Vec::new());
        detector.record_notification("last".into(), Utc::now() - chrono::Duration::hours(13));
        let channel = RecordingChannel::default();
        let alerts = Arc::new(AlertDispatcher::new("WhaleWatch", vec![Box::new(channel.clone())]));
        let shutdown = Shutdown::new();

        let task = tokio::spawn(run_liveness_timer(
            StaleGuard::new(detector, alerts),
            Duration::from_secs(600),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(1_250)).await;
        assert_eq!(channel.sent.lock().len(), 2);

        shutdown.trigger();
        task.await.unwrap();
    }
}
