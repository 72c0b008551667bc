// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Aggregator statistics tracking and reporting.
//!
//! Updates are throttled (every 10 seconds or every 500 pushed buffers) so a
//! 10ms output cadence does not flood the receiver.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use ts_rs::TS;

/// Runtime counters for an aggregation loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AggregatorStats {
    /// Calls to `aggregate`
    pub cycles: u64,
    /// Output buffers handed downstream
    pub pushed: u64,
    /// Cycles that ended with "need more data"
    pub need_data: u64,
    /// Cycles run because a deadline expired
    pub timeouts: u64,
    /// Frames written into output buffers
    pub output_frames: u64,
    /// Input frames dropped across all pads
    pub dropped_frames: u64,
    /// Stream format errors reported
    pub not_negotiated: u64,
    /// Seconds since the loop started
    pub duration_secs: f64,
}

#[derive(Debug, Clone)]
pub struct AggregatorStatsUpdate {
    pub name: String,
    pub stats: AggregatorStats,
    pub timestamp: SystemTime,
}

/// Helper for tracking and throttling stats updates.
pub struct AggregatorStatsTracker {
    stats: AggregatorStats,
    start_time: std::time::Instant,
    last_send: std::time::Instant,
    name: String,
    stats_tx: Option<tokio::sync::mpsc::Sender<AggregatorStatsUpdate>>,
}

impl AggregatorStatsTracker {
    const SEND_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
    const SEND_PUSH_THRESHOLD: u64 = 500;

    pub fn new(
        name: String,
        stats_tx: Option<tokio::sync::mpsc::Sender<AggregatorStatsUpdate>>,
    ) -> Self {
        let now = std::time::Instant::now();
        Self { stats: AggregatorStats::default(), start_time: now, last_send: now, name, stats_tx }
    }

    #[inline]
    pub const fn cycle(&mut self, timeout: bool) {
        self.stats.cycles += 1;
        if timeout {
            self.stats.timeouts += 1;
        }
    }

    #[inline]
    pub const fn pushed(&mut self, frames: u64) {
        self.stats.pushed += 1;
        self.stats.output_frames += frames;
    }

    #[inline]
    pub const fn need_data(&mut self) {
        self.stats.need_data += 1;
    }

    #[inline]
    pub const fn not_negotiated(&mut self) {
        self.stats.not_negotiated += 1;
    }

    /// Records the current total of dropped input frames.
    #[inline]
    pub const fn set_dropped(&mut self, total: u64) {
        self.stats.dropped_frames = total;
    }

    pub fn snapshot(&self) -> AggregatorStats {
        let mut stats = self.stats.clone();
        stats.duration_secs = self.start_time.elapsed().as_secs_f64();
        stats
    }

    /// Send stats if 10s passed or another batch of buffers was pushed.
    pub fn maybe_send(&mut self) {
        let should_send = self.last_send.elapsed() >= Self::SEND_INTERVAL
            || (self.stats.pushed > 0 && self.stats.pushed.is_multiple_of(Self::SEND_PUSH_THRESHOLD));

        if should_send {
            self.force_send();
        }
    }

    pub fn force_send(&mut self) {
        if let Some(ref stats_tx) = self.stats_tx {
            let _ = stats_tx.try_send(AggregatorStatsUpdate {
                name: self.name.clone(),
                stats: self.snapshot(),
                timestamp: SystemTime::now(),
            });
            self.last_send = std::time::Instant::now();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_every_push_threshold() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let mut tracker = AggregatorStatsTracker::new("mix".to_string(), Some(tx));

        for _ in 0..499 {
            tracker.cycle(false);
            tracker.pushed(480);
            tracker.maybe_send();
        }
        assert!(rx.try_recv().is_err());

        tracker.cycle(true);
        tracker.pushed(480);
        tracker.maybe_send();

        let update = rx.recv().await.unwrap();
        assert_eq!(update.stats.pushed, 500);
        assert_eq!(update.stats.cycles, 500);
        assert_eq!(update.stats.timeouts, 1);
        assert_eq!(update.stats.output_frames, 240_000);
    }

    #[test]
    fn tracker_without_channel_is_silent() {
        let mut tracker = AggregatorStatsTracker::new("mix".to_string(), None);
        tracker.need_data();
        tracker.force_send();
        assert_eq!(tracker.snapshot().need_data, 1);
    }
}
