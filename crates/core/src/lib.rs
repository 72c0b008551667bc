// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! MixKit Core - data model for sample-accurate audio aggregation.
//!
//! ## Core Modules
//!
//! - [`types`]: Audio formats, buffers and buffer flags
//! - [`time`]: Nanosecond clock time and exact integer scaling
//! - [`segment`]: Playback segments (running time / stream time mapping)
//! - [`buffer_pool`]: Recycled byte storage for output buffers
//! - [`qos`]: Quality-of-service reports for dropped samples
//! - [`state`]: Aggregation loop state machine and lifecycle tracking
//! - [`stats`]: Throttled statistics reporting
//! - [`error`]: Error types and handling
//! - [`helpers`]: Opaque configuration parsing

pub mod buffer_pool;
pub mod error;
pub mod helpers;
pub mod qos;
pub mod segment;
pub mod state;
pub mod stats;
pub mod time;
pub mod types;

pub use buffer_pool::{BufferPool, PooledBytes};
pub use error::{FlowError, MixKitError};
pub use helpers::config_helpers;
pub use qos::{QosCollector, QosObserver, QosReport};
pub use segment::Segment;
pub use state::{state_helpers, AggregatorState, AggregatorStateUpdate, StopReason};
pub use stats::{AggregatorStats, AggregatorStatsTracker, AggregatorStatsUpdate};
pub use time::ClockTime;
pub use types::{AudioBuffer, AudioFormat, BufferFlags, SampleFormat};
