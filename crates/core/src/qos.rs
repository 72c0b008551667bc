// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Quality-of-service reports for dropped input samples.
//!
//! Reports are purely observational: observers must never block, and a full
//! channel simply loses the report.

use crate::time::ClockTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use ts_rs::TS;

/// Emitted when an input pad drops samples (late data, discontinuity resync, catch-up).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct QosReport {
    /// Name of the pad that dropped samples.
    #[ts(type = "string")]
    pub pad: Arc<str>,
    /// Whether the aggregator is operating live.
    pub live: bool,
    /// Running time of the first dropped sample.
    pub running_time: Option<ClockTime>,
    /// Stream time of the first dropped sample.
    pub stream_time: Option<ClockTime>,
    /// Buffer timestamp of the first dropped sample.
    pub timestamp: Option<ClockTime>,
    /// Duration of the dropped region.
    pub duration: ClockTime,
    /// Samples mixed on this pad since the last segment.
    pub processed: u64,
    /// Samples dropped on this pad since the last segment.
    pub dropped: u64,
}

/// Receives QoS reports. Implementations must not block.
pub trait QosObserver: Send + Sync {
    fn on_qos(&self, report: QosReport);
}

impl QosObserver for mpsc::Sender<QosReport> {
    fn on_qos(&self, report: QosReport) {
        let _ = self.try_send(report);
    }
}

/// Observer that keeps every report in memory.
#[derive(Debug, Default)]
pub struct QosCollector {
    reports: std::sync::Mutex<Vec<QosReport>>,
}

impl QosCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains the collected reports.
    pub fn take(&self) -> Vec<QosReport> {
        self.reports.lock().map(|mut r| std::mem::take(&mut *r)).unwrap_or_default()
    }
}

impl QosObserver for QosCollector {
    fn on_qos(&self, report: QosReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn report(dropped: u64) -> QosReport {
        QosReport {
            pad: Arc::from("sink_0"),
            live: false,
            running_time: Some(ClockTime::ZERO),
            stream_time: Some(ClockTime::ZERO),
            timestamp: Some(ClockTime::ZERO),
            duration: ClockTime::from_mseconds(10),
            processed: 0,
            dropped,
        }
    }

    #[test]
    fn channel_observer_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.on_qos(report(1));
        tx.on_qos(report(2));
        assert_eq!(rx.try_recv().unwrap().dropped, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn collector_keeps_reports_until_taken() {
        let collector = QosCollector::new();
        collector.on_qos(report(480));
        collector.on_qos(report(960));
        let taken = collector.take();
        assert_eq!(taken.iter().map(|r| r.dropped).collect::<Vec<_>>(), vec![480, 960]);
        assert!(collector.take().is_empty());
    }
}
