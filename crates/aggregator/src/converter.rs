// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-pad sample layout conversion.
//!
//! A pad whose declared format differs from the negotiated output format gets a
//! [`FormatConverter`]. Conversions never resample: input and output rates must
//! match, so frame counts are preserved 1:1 and only sample width, encoding and
//! channel layout change.

use mixkit_core::config_helpers;
use mixkit_core::{AudioBuffer, AudioFormat, MixKitError, SampleFormat};
use schemars::JsonSchema;
use serde::Deserialize;

/// Converts buffers from one audio format to another.
pub trait FormatConverter: Send {
    /// True when [`FormatConverter::convert`] returns its input untouched.
    fn is_passthrough(&self) -> bool;

    /// Converts one buffer. Timing metadata and flags are carried over.
    ///
    /// # Errors
    ///
    /// Returns `MixKitError::NotNegotiated` when the buffer does not match the input format.
    fn convert(&mut self, input: &AudioBuffer) -> Result<AudioBuffer, MixKitError>;
}

/// Settings understood by [`SampleConverter`], parsed from the opaque per-pad converter value.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[serde(default)]
pub struct ChannelMixConfig {
    /// Gain matrix with one row per output channel and one column per input channel.
    pub mix_matrix: Option<Vec<Vec<f64>>>,
}

/// Default converter: decodes to f64, applies a channel matrix, encodes to the output format.
pub struct SampleConverter {
    in_format: AudioFormat,
    out_format: AudioFormat,
    /// `matrix[out_ch][in_ch]`
    matrix: Vec<Vec<f64>>,
    passthrough: bool,
    frame: Vec<f64>,
}

impl SampleConverter {
    /// Builds a converter between two formats.
    ///
    /// # Errors
    ///
    /// Returns `MixKitError::NotNegotiated` when either format is invalid, the rates differ,
    /// or the configured mix matrix does not have `out.channels x in.channels` entries.
    pub fn new(
        in_format: &AudioFormat,
        out_format: &AudioFormat,
        params: Option<&serde_json::Value>,
    ) -> Result<Self, MixKitError> {
        if !in_format.is_valid() || !out_format.is_valid() {
            return Err(MixKitError::NotNegotiated(format!(
                "cannot convert between {in_format} and {out_format}"
            )));
        }
        if in_format.sample_rate != out_format.sample_rate {
            return Err(MixKitError::NotNegotiated(format!(
                "sample rate mismatch: {} != {} (resampling is not supported)",
                in_format.sample_rate, out_format.sample_rate
            )));
        }

        let config: ChannelMixConfig = config_helpers::parse_config_optional(params)
            .map_err(|e| MixKitError::NotNegotiated(e.to_string()))?;

        let in_ch = usize::from(in_format.channels);
        let out_ch = usize::from(out_format.channels);

        let (matrix, custom) = match config.mix_matrix {
            Some(matrix) => {
                if matrix.len() != out_ch || matrix.iter().any(|row| row.len() != in_ch) {
                    return Err(MixKitError::NotNegotiated(format!(
                        "mix matrix must be {out_ch}x{in_ch} for {in_format} -> {out_format}"
                    )));
                }
                (matrix, true)
            },
            None => (default_matrix(in_ch, out_ch), false),
        };

        let passthrough = !custom && in_format == out_format;
        Ok(Self {
            in_format: *in_format,
            out_format: *out_format,
            matrix,
            passthrough,
            frame: vec![0.0; in_ch],
        })
    }
}

/// Identity for equal counts, duplicate mono, average to mono, cyclic otherwise.
#[allow(clippy::cast_precision_loss)]
fn default_matrix(in_ch: usize, out_ch: usize) -> Vec<Vec<f64>> {
    (0..out_ch)
        .map(|o| {
            (0..in_ch)
                .map(|i| {
                    if in_ch == out_ch {
                        if i == o { 1.0 } else { 0.0 }
                    } else if in_ch == 1 {
                        1.0
                    } else if out_ch == 1 {
                        1.0 / in_ch as f64
                    } else if i == o % in_ch {
                        1.0
                    } else {
                        0.0
                    }
                })
                .collect()
        })
        .collect()
}

impl FormatConverter for SampleConverter {
    fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    fn convert(&mut self, input: &AudioBuffer) -> Result<AudioBuffer, MixKitError> {
        if self.passthrough {
            return Ok(input.clone());
        }

        let in_bpf = self.in_format.bpf();
        let out_bpf = self.out_format.bpf();
        if input.len() % in_bpf != 0 {
            return Err(MixKitError::NotNegotiated(format!(
                "buffer of {} bytes is not a whole number of {} frames",
                input.len(),
                self.in_format
            )));
        }

        let in_width = self.in_format.sample_format.width();
        let out_width = self.out_format.sample_format.width();
        let frames = input.len() / in_bpf;
        let mut out = vec![0u8; frames * out_bpf];

        for (in_frame, out_frame) in input.data.chunks_exact(in_bpf).zip(out.chunks_exact_mut(out_bpf)) {
            for (slot, raw) in self.frame.iter_mut().zip(in_frame.chunks_exact(in_width)) {
                *slot = decode_sample(self.in_format.sample_format, raw);
            }
            for (row, raw) in self.matrix.iter().zip(out_frame.chunks_exact_mut(out_width)) {
                let value: f64 = row.iter().zip(&self.frame).map(|(gain, s)| gain * s).sum();
                encode_sample(self.out_format.sample_format, value, raw);
            }
        }

        let mut converted = AudioBuffer::new(out);
        converted.copy_metadata_from(input);
        Ok(converted)
    }
}

/// Reads one sample as a normalized f64 (`-1.0..1.0` for integer formats).
pub fn decode_sample(format: SampleFormat, raw: &[u8]) -> f64 {
    match format {
        SampleFormat::U8 => (f64::from(raw[0]) - 128.0) / 128.0,
        SampleFormat::S16Le => f64::from(i16::from_le_bytes([raw[0], raw[1]])) / 32_768.0,
        SampleFormat::S32Le => {
            f64::from(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])) / 2_147_483_648.0
        },
        SampleFormat::F32 => f64::from(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
        SampleFormat::F64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[..8]);
            f64::from_le_bytes(b)
        },
    }
}

/// Writes a normalized f64 into one sample slot, clamping integer formats to their range.
///
/// `raw` must be exactly one sample wide.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn encode_sample(format: SampleFormat, value: f64, raw: &mut [u8]) {
    match format {
        SampleFormat::U8 => raw[0] = value.mul_add(128.0, 128.0).round().clamp(0.0, 255.0) as u8,
        SampleFormat::S16Le => {
            let v = (value * 32_768.0).round().clamp(-32_768.0, 32_767.0) as i16;
            raw.copy_from_slice(&v.to_le_bytes());
        },
        SampleFormat::S32Le => {
            let v = (value * 2_147_483_648.0)
                .round()
                .clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32;
            raw.copy_from_slice(&v.to_le_bytes());
        },
        SampleFormat::F32 => raw.copy_from_slice(&(value as f32).to_le_bytes()),
        SampleFormat::F64 => raw.copy_from_slice(&value.to_le_bytes()),
    }
}
