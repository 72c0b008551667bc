// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! MixKit Aggregator - sample-accurate mixing of any number of audio inputs.
//!
//! ## Modules
//!
//! - [`aggregator`]: The aggregation cycle, lifecycle, renegotiation and queries
//! - [`pad`]: Input pads (producer intake, discontinuity detection, resync)
//! - [`mixer`]: Per-format sample mixing with volume and mute
//! - [`converter`]: Format conversion from pad formats to the output format
//! - [`allocator`]: Output block storage
//! - [`registry`]: Pluggable converter and allocator capabilities
//! - [`driver`]: Thread that runs the cycle on data arrival or live deadlines
//! - [`config`]: Aggregator and pad configuration

pub mod aggregator;
pub mod allocator;
pub mod config;
pub mod converter;
pub mod downstream;
pub mod driver;
pub mod mixer;
pub mod pad;
pub mod producer;
pub mod registry;

#[cfg(test)]
pub mod test_utils;

pub use aggregator::{Aggregator, CycleOutcome, Latency, PositionFormat};
pub use allocator::{OutputBufferAllocator, PooledAllocator, SilenceAllocator};
pub use config::{AggregatorConfig, DurationFraction, PadConfig};
pub use converter::{decode_sample, encode_sample, ChannelMixConfig, FormatConverter, SampleConverter};
pub use downstream::{ChannelDownstream, Downstream};
pub use driver::{AggregatorDriver, DriverCommand, DriverOptions};
pub use mixer::{Gain, SampleMixer};
pub use pad::{InputPad, NextSample};
pub use producer::Producer;
pub use registry::{AggregatorRegistry, ConverterFactory};
