use std::time::Duration;

use super::window::WindowStore;

/// Immutable detection settings, built once from [`crate::config::Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdConfig {
    /// Sizes at or above this are always notable.
    pub absolute_threshold: f64,
    /// Below this many samples the adaptive check never fires.
    pub minimum_sample_count: usize,
    /// Share of the window (in percent, `(0, 100]`) averaged for the adaptive threshold.
    pub upper_percentile: f64,
    pub retention: chrono::Duration,
    pub prune_interval: Duration,
}

/// Outcome of evaluating one transaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Cleared the absolute threshold.
    Absolute,
    /// Cleared the adaptive threshold.
    Adaptive { threshold: f64 },
    /// Too little history to judge against the adaptive threshold.
    WarmingUp { samples: usize },
    Ordinary { threshold: f64 },
}

impl Verdict {
    pub fn is_notable(&self) -> bool {
        matches!(self, Verdict::Absolute | Verdict::Adaptive { .. })
    }
}

/// Decides whether a transaction is a whale.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    config: ThresholdConfig,
}

impl ThresholdPolicy {
    pub fn new(config: ThresholdConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    /// Record `size` into the window, then judge it.
    ///
    /// Every transaction is recorded, notable or not, so it counts toward
    /// later averages.
    pub fn evaluate(&self, window: &mut WindowStore, size: f64) -> Verdict {
        window.record(size);

        if size >= self.config.absolute_threshold {
            return Verdict::Absolute;
        }

        let samples = window.count();
        if samples < self.config.minimum_sample_count {
            return Verdict::WarmingUp { samples };
        }

        let threshold = self.adaptive_threshold(window);
        if size >= threshold {
            Verdict::Adaptive { threshold }
        } else {
            Verdict::Ordinary { threshold }
        }
    }

    /// Current adaptive threshold for `window`.
    pub fn adaptive_threshold(&self, window: &WindowStore) -> f64 {
        window.upper_percentile_average(self.config.upper_percentile)
    }
}
