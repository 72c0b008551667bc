// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use mixkit_core::time::{gcd, scale};
use mixkit_core::{AudioFormat, ClockTime, MixKitError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Exact duration expressed as `numerator / denominator` seconds.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub struct DurationFraction {
    pub numerator: u64,
    pub denominator: u64,
}

impl Default for DurationFraction {
    fn default() -> Self {
        Self { numerator: 1, denominator: 100 }
    }
}

impl DurationFraction {
    pub const fn new(numerator: u64, denominator: u64) -> Self {
        Self { numerator, denominator }
    }

    /// Builds the fraction for a nanosecond duration, reduced to lowest terms.
    pub fn from_clock_time(duration: ClockTime) -> Self {
        Self::new(duration.nseconds(), ClockTime::SECOND).reduced()
    }

    #[must_use]
    pub const fn reduced(self) -> Self {
        let g = gcd(self.numerator, self.denominator);
        if g == 0 {
            return self;
        }
        Self { numerator: self.numerator / g, denominator: self.denominator / g }
    }

    /// The duration truncated to nanoseconds.
    pub fn to_clock_time(self) -> ClockTime {
        ClockTime(scale(ClockTime::SECOND, self.numerator, self.denominator))
    }

    /// # Errors
    ///
    /// Returns `MixKitError::Configuration` for a zero numerator or denominator.
    pub fn validate(&self) -> Result<(), MixKitError> {
        if self.denominator == 0 {
            return Err(MixKitError::Configuration(
                "output_buffer_duration denominator must be > 0".to_string(),
            ));
        }
        if self.numerator == 0 {
            return Err(MixKitError::Configuration(
                "output_buffer_duration must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for an [`Aggregator`](crate::Aggregator).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Duration of every output buffer, as an exact fraction of a second.
    ///
    /// Example: `1/100` => 10ms blocks, 480 frames at 48kHz.
    pub output_buffer_duration: DurationFraction,

    /// Timestamp drift (ns) a pad may accumulate before its data counts as discontinuous.
    pub alignment_threshold_ns: u64,

    /// How long (ns) a drift above the alignment threshold must persist before resyncing.
    ///
    /// `0` resyncs on the first drifting buffer.
    pub discont_wait_ns: u64,

    /// Skip pads that were marked inactive instead of waiting for them.
    pub ignore_inactive_pads: bool,

    /// Always operate live, producing output on deadlines even without live producers.
    /// Only read at construction.
    pub force_live: bool,

    /// Additional latency (ns) added to live deadlines.
    pub latency_ns: u64,

    /// Fixed output format applied on every start. Left unset, the host negotiates it.
    pub output_format: Option<AudioFormat>,

    /// Maximum number of buffers queued per pad before producers block.
    pub pad_queue_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            output_buffer_duration: DurationFraction::default(),
            alignment_threshold_ns: 40 * ClockTime::MSECOND,
            discont_wait_ns: ClockTime::SECOND,
            ignore_inactive_pads: false,
            force_live: false,
            latency_ns: 0,
            output_format: None,
            pad_queue_capacity: 8,
        }
    }
}

impl AggregatorConfig {
    /// # Errors
    ///
    /// Returns `MixKitError::Configuration` when any field is out of range.
    pub fn validate(&self) -> Result<(), MixKitError> {
        self.output_buffer_duration.validate()?;
        if self.pad_queue_capacity == 0 {
            return Err(MixKitError::Configuration("pad_queue_capacity must be > 0".to_string()));
        }
        if let Some(format) = &self.output_format {
            if !format.is_valid() {
                return Err(MixKitError::Configuration(format!(
                    "invalid output format: {format}"
                )));
            }
        }
        Ok(())
    }

    pub const fn alignment_threshold(&self) -> ClockTime {
        ClockTime(self.alignment_threshold_ns)
    }

    pub const fn discont_wait(&self) -> ClockTime {
        ClockTime(self.discont_wait_ns)
    }
}

const fn default_volume() -> f64 {
    1.0
}

/// Per-pad settings.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(default)]
pub struct PadConfig {
    /// Linear gain applied while mixing (0.0 - 10.0).
    #[serde(default = "default_volume")]
    pub volume: f64,

    pub mute: bool,

    /// Report dropped samples on this pad to the QoS observer.
    pub qos_messages: bool,

    /// The producer is a live source; makes the aggregator operate on deadlines.
    pub live: bool,

    /// Opaque settings handed to the format converter factory.
    pub converter: Option<serde_json::Value>,
}

impl Default for PadConfig {
    fn default() -> Self {
        Self { volume: default_volume(), mute: false, qos_messages: false, live: false, converter: None }
    }
}

impl PadConfig {
    pub const MAX_VOLUME: f64 = 10.0;

    /// # Errors
    ///
    /// Returns `MixKitError::Configuration` for a volume outside `0.0..=10.0`.
    pub fn validate(&self) -> Result<(), MixKitError> {
        if !(0.0..=Self::MAX_VOLUME).contains(&self.volume) {
            return Err(MixKitError::Configuration(format!(
                "volume must be within 0.0..={}, got {}",
                Self::MAX_VOLUME,
                self.volume
            )));
        }
        Ok(())
    }
}
