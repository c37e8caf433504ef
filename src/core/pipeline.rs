use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::detector::SharedDetector;
use super::liveness::StaleGuard;
use super::policy::Verdict;
use super::{TransactionSummary, TxRecord, validate_size};
use crate::notifications::Notifier;
use crate::stream::TxConsumer;

/// Log a progress line every this many transactions.
const PROGRESS_EVERY: u64 = 1000;

#[derive(Debug, Default)]
pub struct PipelineStats {
    transactions_seen: AtomicU64,
    coinbase_skipped: AtomicU64,
    rejected: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineCounters {
    pub transactions_seen: u64,
    pub coinbase_skipped: u64,
    pub rejected: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
}

impl PipelineStats {
    pub fn counters(&self) -> PipelineCounters {
        PipelineCounters {
            transactions_seen: self.transactions_seen.load(Ordering::Relaxed),
            coinbase_skipped: self.coinbase_skipped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
        }
    }
}

/// What happened to one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Coinbase,
    Rejected,
    Ignored(Verdict),
    Notified(String),
    NotifyFailed,
}

/// Per-transaction flow: liveness check, record and evaluate, notify.
pub struct Pipeline {
    detector: SharedDetector,
    notifier: Arc<dyn Notifier>,
    guard: StaleGuard,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(detector: SharedDetector, notifier: Arc<dyn Notifier>, guard: StaleGuard) -> Self {
        Self {
            detector,
            notifier,
            guard,
            stats: Arc::default(),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub async fn process(&self, tx: TxRecord) -> Outcome {
        self.guard.check(Utc::now()).await;

        let seen = self.stats.transactions_seen.fetch_add(1, Ordering::Relaxed) + 1;
        if seen % PROGRESS_EVERY == 0 {
            let counters = self.stats.counters();
            info!(
                window = self.detector.count(),
                notified = counters.notifications_sent,
                "Pipeline processed {seen} txs"
            );
        }

        if tx.is_coinbase {
            self.stats.coinbase_skipped.fetch_add(1, Ordering::Relaxed);
            debug!(tx = %tx.hash, height = tx.block_height, "Skipping coinbase");
            return Outcome::Coinbase;
        }

        let size = match validate_size(tx.size()) {
            Ok(size) => size,
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(tx = %tx.hash, "Rejected transaction: {e}");
                return Outcome::Rejected;
            }
        };

        let verdict = self.detector.evaluate(size);
        if !verdict.is_notable() {
            debug!(tx = %tx.hash, amount = size, verdict = ?verdict, "Below threshold");
            return Outcome::Ignored(verdict);
        }

        let summary = TransactionSummary::new(&tx, verdict);
        match self.notifier.notify(&summary).await {
            Ok(message) => {
                self.detector.record_notification(message.clone(), Utc::now());
                self.stats.notifications_sent.fetch_add(1, Ordering::Relaxed);
                info!(tx = %tx.hash, amount = size, verdict = ?verdict, "Notification sent");
                Outcome::Notified(message)
            }
            Err(e) => {
                self.stats.notifications_failed.fetch_add(1, Ordering::Relaxed);
                error!(tx = %tx.hash, amount = size, "Notification failed, dropping: {e}");
                Outcome::NotifyFailed
            }
        }
    }
}

#[async_trait]
impl TxConsumer for Pipeline {
    async fn consume(&self, tx: TxRecord) {
        self.process(tx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::liveness::{LivenessConfig, LivenessWatchdog, NEVER_NOTIFIED};
    use crate::core::policy::{ThresholdConfig, ThresholdPolicy};
    use crate::notifications::testing::RecordingChannel;
    use crate::notifications::{AlertDispatcher, NotifyError};
    use bitcoin::Amount;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct FakeNotifier {
        sent: Mutex<Vec<TransactionSummary>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn notify(&self, tx: &TransactionSummary) -> Result<String, NotifyError> {
            if self.fail {
                return Err(NotifyError::Rejected {
                    service: "fake",
                    reason: "down".into(),
                });
            }
            self.sent.lock().push(tx.clone());
            Ok(format!("whale {}", tx.hash))
        }
    }

    struct Fixture {
        pipeline: Pipeline,
        detector: SharedDetector,
        notifier: Arc<FakeNotifier>,
        alerts: RecordingChannel,
    }

    fn fixture(fail: bool) -> Fixture {
        let detector = SharedDetector::new(
            ThresholdPolicy::new(ThresholdConfig {
                absolute_threshold: 100.0,
                minimum_sample_count: 5,
                upper_percentile: 20.0,
                retention: chrono::Duration::hours(24),
                prune_interval: Duration::from_secs(1800),
            }),
            LivenessWatchdog::new(LivenessConfig {
                stale_threshold: chrono::Duration::hours(12),
                check_interval: Duration::from_secs(600),
                alert_once_per_episode: false,
            }),
            Vec::new(),
        );
        let notifier = Arc::new(FakeNotifier {
            fail,
            ..Default::default()
        });
        let alerts = RecordingChannel::default();
        let dispatcher = Arc::new(AlertDispatcher::new("WhaleWatch", vec![Box::new(alerts.clone())]));
        let guard = StaleGuard::new(detector.clone(), dispatcher);
        Fixture {
            pipeline: Pipeline::new(detector.clone(), notifier.clone(), guard),
            detector,
            notifier,
            alerts,
        }
    }

    fn tx(hash: &str, sats: u64) -> TxRecord {
        TxRecord {
            hash: hash.into(),
            total_output_value: Amount::from_sat(sats),
            fee: Amount::from_sat(300),
            block_height: 10,
            is_coinbase: false,
        }
    }

    const COIN: u64 = 100_000_000;

    #[tokio::test]
    async fn absolute_whale_is_notified_and_updates_liveness() {
        let f = fixture(false);
        let outcome = f.pipeline.process(tx("big", 150 * COIN)).await;
        assert_eq!(outcome, Outcome::Notified("whale big".into()));

        let sent = f.notifier.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].amount, 150.0);
        assert_eq!(sent[0].verdict, Verdict::Absolute);
        assert_eq!(f.detector.liveness().last_message, "whale big");
        assert_eq!(f.pipeline.stats().counters().notifications_sent, 1);
    }

    #[tokio::test]
    async fn early_transactions_are_recorded_but_not_notified() {
        let f = fixture(false);
        for i in 0..3 {
            let outcome = f.pipeline.process(tx(&format!("t{i}"), 10 * COIN)).await;
            assert!(matches!(outcome, Outcome::Ignored(Verdict::WarmingUp { .. })));
        }
        assert_eq!(f.detector.count(), 3);
        assert!(f.notifier.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn adaptive_whale_after_warmup() {
        let f = fixture(false);
        for i in 1..=10u64 {
            f.pipeline.process(tx(&format!("t{i}"), i * COIN)).await;
        }
        // top 3 of eleven samples: (10 + 9.6 + 9) / 3 = 9.53
        let outcome = f.pipeline.process(tx("w", 96 * COIN / 10)).await;
        assert!(matches!(outcome, Outcome::Notified(_)));
        assert!(matches!(f.notifier.sent.lock().last().unwrap().verdict, Verdict::Adaptive { .. }));
    }

    #[tokio::test]
    #[traced_test]
    async fn ignored_verdict_is_logged() {
        let f = fixture(false);
        f.pipeline.process(tx("small", COIN)).await;
        assert!(logs_contain("Below threshold"));
        assert!(logs_contain("WarmingUp"));
    }

    #[tokio::test]
    async fn coinbase_is_skipped_entirely() {
        let f = fixture(false);
        let mut coinbase = tx("cb", 1_000 * COIN);
        coinbase.is_coinbase = true;
        assert_eq!(f.pipeline.process(coinbase).await, Outcome::Coinbase);
        assert_eq!(f.detector.count(), 0);
        let counters = f.pipeline.stats().counters();
        assert_eq!(counters.transactions_seen, 1);
        assert_eq!(counters.coinbase_skipped, 1);
    }

    #[tokio::test]
    async fn failed_notification_is_dropped() {
        let f = fixture(true);
        assert_eq!(f.pipeline.process(tx("big", 500 * COIN)).await, Outcome::NotifyFailed);
        assert_eq!(f.detector.liveness().last_message, NEVER_NOTIFIED);
        assert_eq!(f.detector.count(), 1);
        assert_eq!(f.pipeline.stats().counters().notifications_failed, 1);

        // processing continues
        assert!(matches!(f.pipeline.process(tx("small", COIN)).await, Outcome::Ignored(_)));
    }

    #[tokio::test]
    async fn stale_liveness_escalates_before_processing() {
        let f = fixture(false);
        f.detector
            .record_notification("old".into(), Utc::now() - chrono::Duration::hours(13));

        f.pipeline.process(tx("t", COIN)).await;
        let alerts = f.alerts.sent.lock();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].title, "WhaleWatch: notifications stopped");
        assert!(alerts[0].text.contains("(old)"));
    }
}
