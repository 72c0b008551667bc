// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Core data types flowing through the aggregator.
//!
//! - [`AudioFormat`]: declared layout of an interleaved PCM stream
//! - [`AudioBuffer`]: an immutable chunk of samples plus timing metadata
//! - [`BufferFlags`]: gap/discont/resync markers set by producers

use crate::time::ClockTime;
use bytes::Bytes;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Describes the specific format of raw audio samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,    // 8-bit unsigned integer, silence at 0x80
    S16Le, // 16-bit signed integer, little-endian
    S32Le, // 32-bit signed integer, little-endian
    F32,   // 32-bit floating point, little-endian
    F64,   // 64-bit floating point, little-endian
}

impl SampleFormat {
    /// Size of one sample in bytes.
    pub const fn width(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16Le => 2,
            Self::S32Le | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Writes the canonical silence pattern for this format into `data`.
    pub fn fill_silence(self, data: &mut [u8]) {
        match self {
            Self::U8 => data.fill(0x80),
            // IEEE 0.0 and signed 0 are both all-zero bytes
            Self::S16Le | Self::S32Le | Self::F32 | Self::F64 => data.fill(0),
        }
    }
}

/// Contains the detailed metadata for a raw audio stream.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self { sample_rate, channels, sample_format }
    }

    /// Bytes per frame (one sample for every channel).
    pub const fn bpf(&self) -> usize {
        self.channels as usize * self.sample_format.width()
    }

    /// A format is usable once both rate and channel count are non-zero.
    pub const fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}Hz {}ch", self.sample_format, self.sample_rate, self.channels)
    }
}

/// Markers a producer may attach to a buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct BufferFlags {
    /// The buffer stands for silence; its payload is irrelevant.
    pub gap: bool,
    /// The stream is not continuous with the previous buffer.
    pub discont: bool,
    /// Timestamps must be trusted over running sample counts.
    pub resync: bool,
}

/// An immutable chunk of interleaved audio samples.
///
/// Payload bytes are shared (`Bytes`), so cloning is cheap and converters can
/// hand back the very same storage when no conversion is needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioBuffer {
    pub data: Bytes,
    /// Presentation timestamp of the first frame.
    pub pts: Option<ClockTime>,
    pub duration: Option<ClockTime>,
    /// Sample offset of the first frame.
    pub offset: Option<u64>,
    /// Sample offset one past the last frame.
    pub offset_end: Option<u64>,
    pub flags: BufferFlags,
}

impl AudioBuffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into(), ..Default::default() }
    }

    /// Creates a payload-less gap placeholder of the given duration.
    pub fn gap(pts: Option<ClockTime>, duration: ClockTime) -> Self {
        Self {
            data: Bytes::new(),
            pts,
            duration: Some(duration),
            flags: BufferFlags { gap: true, ..BufferFlags::default() },
            ..Default::default()
        }
    }

    #[must_use]
    pub const fn with_pts(mut self, pts: ClockTime) -> Self {
        self.pts = Some(pts);
        self
    }

    #[must_use]
    pub const fn with_duration(mut self, duration: ClockTime) -> Self {
        self.duration = Some(duration);
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of whole frames for the given bytes-per-frame.
    pub fn frames(&self, bpf: usize) -> usize {
        if bpf == 0 {
            0
        } else {
            self.data.len() / bpf
        }
    }

    /// Copies timing and flags from `other`, keeping this buffer's payload.
    pub fn copy_metadata_from(&mut self, other: &Self) {
        self.pts = other.pts;
        self.duration = other.duration;
        self.offset = other.offset;
        self.offset_end = other.offset_end;
        self.flags = other.flags;
    }
}
