// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Aggregator state management and lifecycle tracking.
//!
//! ## State Machine
//!
//! ```text
//!     Initializing
//!          ↓
//!       Running ←──┐
//!          ↓       │
//!       Degraded ──┤
//!          ↓       │
//!       Failed ────┘ (after renegotiation)
//!          ↓
//!       Stopped
//! ```
//!
//! `Failed` is used for stream format errors. Those halt aggregation until a new
//! output or pad format arrives, after which the driver goes back to `Running`.

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use ts_rs::TS;

/// Why the aggregation loop entered the `Stopped` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every pad reached end-of-stream and the last buffer was pushed.
    Completed,
    /// Downstream refused a buffer.
    OutputClosed,
    /// Shutdown was requested.
    Shutdown,
    /// A reason not recognized by this client/version.
    Unknown,
}

impl<'de> Deserialize<'de> for StopReason {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from(value.as_str()))
    }
}

impl From<&str> for StopReason {
    fn from(value: &str) -> Self {
        match value {
            "completed" | "eos" => Self::Completed,
            "output_closed" => Self::OutputClosed,
            "shutdown" => Self::Shutdown,
            _ => Self::Unknown,
        }
    }
}

/// Runtime state of an aggregation loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum AggregatorState {
    /// Thread spawned, first cycle not run yet.
    Initializing,

    /// Producing output normally.
    Running,

    /// Still producing output, but at least one pad keeps missing its deadline
    /// and is being filled with silence.
    Degraded { reason: String },

    /// A stream format error stopped aggregation; waiting for renegotiation.
    Failed { reason: String },

    /// The loop exited.
    Stopped { reason: StopReason },
}

/// A state update sent by the aggregation loop.
#[derive(Debug, Clone)]
pub struct AggregatorStateUpdate {
    pub name: String,
    pub state: AggregatorState,
    pub timestamp: SystemTime,
}

impl AggregatorStateUpdate {
    #[inline]
    pub fn new(name: String, state: AggregatorState) -> Self {
        Self { name, state, timestamp: SystemTime::now() }
    }
}

/// Helper functions for emitting state updates.
/// Failures are silently ignored as state tracking is best-effort.
pub mod state_helpers {
    use super::{AggregatorState, AggregatorStateUpdate, StopReason};
    use tokio::sync::mpsc;

    #[inline]
    fn emit_state(
        state_tx: &mpsc::Sender<AggregatorStateUpdate>,
        name: &str,
        state: AggregatorState,
    ) {
        let _ = state_tx.try_send(AggregatorStateUpdate::new(name.to_string(), state));
    }

    #[inline]
    pub fn emit_initializing(state_tx: &mpsc::Sender<AggregatorStateUpdate>, name: &str) {
        emit_state(state_tx, name, AggregatorState::Initializing);
    }

    #[inline]
    pub fn emit_running(state_tx: &mpsc::Sender<AggregatorStateUpdate>, name: &str) {
        emit_state(state_tx, name, AggregatorState::Running);
    }

    #[inline]
    pub fn emit_degraded(
        state_tx: &mpsc::Sender<AggregatorStateUpdate>,
        name: &str,
        reason: impl Into<String>,
    ) {
        emit_state(state_tx, name, AggregatorState::Degraded { reason: reason.into() });
    }

    #[inline]
    pub fn emit_failed(
        state_tx: &mpsc::Sender<AggregatorStateUpdate>,
        name: &str,
        reason: impl Into<String>,
    ) {
        emit_state(state_tx, name, AggregatorState::Failed { reason: reason.into() });
    }

    #[inline]
    pub fn emit_stopped(
        state_tx: &mpsc::Sender<AggregatorStateUpdate>,
        name: &str,
        reason: StopReason,
    ) {
        emit_state(state_tx, name, AggregatorState::Stopped { reason });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn stop_reason_parses_unknown_values() {
        let reason: StopReason = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(reason, StopReason::Completed);
        let reason: StopReason = serde_json::from_str("\"something_else\"").unwrap();
        assert_eq!(reason, StopReason::Unknown);
    }

    #[tokio::test]
    async fn helpers_never_block_on_full_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        state_helpers::emit_running(&tx, "mix");
        state_helpers::emit_failed(&tx, "mix", "dropped");

        let update = rx.recv().await.unwrap();
        assert_eq!(update.name, "mix");
        assert_eq!(update.state, AggregatorState::Running);
        assert!(rx.try_recv().is_err());
    }
}
