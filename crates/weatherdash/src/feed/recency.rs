//! Online/offline detection for raw sensor samples.
//!
//! A fixed staleness threshold misreports sensors whose native cadence is
//! slower than the default. The threshold used here is
//! `max(fixed, 3 × median interval)` over the most recent samples.

use crate::config::SensorConfig;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;

/// Median-interval multiplier for the adaptive threshold.
const CADENCE_MULTIPLIER: u32 = 3;

/// Rolling record of recent sample times for one sensor.
#[derive(Debug, Clone)]
pub struct SensorRecency {
    samples: VecDeque<DateTime<Utc>>,
    window: usize,
    fixed_threshold: Duration,
}

impl SensorRecency {
    pub fn new(window: usize, fixed_threshold: Duration) -> Self {
        let window = window.max(2);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
            fixed_threshold,
        }
    }

    pub fn from_config(config: &SensorConfig) -> Self {
        Self::new(
            config.recency_window,
            Duration::from_millis(config.online_threshold_ms),
        )
    }

    /// Record a sample time, evicting the oldest beyond the window.
    pub fn record(&mut self, at: DateTime<Utc>) {
        self.samples.push_back(at);
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }
    }

    pub fn last_sample(&self) -> Option<DateTime<Utc>> {
        self.samples.iter().max().copied()
    }

    pub fn median_interval(&self) -> Option<Duration> {
        let samples: Vec<DateTime<Utc>> = self.samples.iter().copied().collect();
        median_interval(&samples)
    }

    pub fn threshold(&self) -> Duration {
        let samples: Vec<DateTime<Utc>> = self.samples.iter().copied().collect();
        adaptive_threshold(&samples, self.fixed_threshold)
    }

    /// Whether the newest sample is within the threshold of `now`.
    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_sample() else {
            return false;
        };
        match (now - last).to_std() {
            Ok(age) => age <= self.threshold(),
            // Sample from the future (clock skew) counts as fresh.
            Err(_) => true,
        }
    }
}

/// Median of the positive intervals between consecutive samples.
///
/// `None` with fewer than two distinct sample times.
pub fn median_interval(samples: &[DateTime<Utc>]) -> Option<Duration> {
    let mut sorted = samples.to_vec();
    sorted.sort();

    let mut intervals: Vec<Duration> = sorted
        .windows(2)
        .filter_map(|pair| (pair[1] - pair[0]).to_std().ok())
        .filter(|d| !d.is_zero())
        .collect();
    if intervals.is_empty() {
        return None;
    }
    intervals.sort();

    let mid = intervals.len() / 2;
    if intervals.len() % 2 == 1 {
        Some(intervals[mid])
    } else {
        Some((intervals[mid - 1] + intervals[mid]) / 2)
    }
}

/// `max(fixed, 3 × median interval)`, or `fixed` when no interval is known.
pub fn adaptive_threshold(samples: &[DateTime<Utc>], fixed: Duration) -> Duration {
    match median_interval(samples) {
        Some(median) => fixed.max(median * CADENCE_MULTIPLIER),
        None => fixed,
    }
}
