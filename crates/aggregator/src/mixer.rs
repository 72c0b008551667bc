// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Sample-domain accumulation of one input region into the output block.
//!
//! The variant is resolved once per negotiated output format so the inner
//! loops stay monomorphic. Integer formats add with saturation, floats add
//! without clamping.

use mixkit_core::SampleFormat;

/// Per-pad gain applied while mixing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gain {
    pub volume: f64,
    pub mute: bool,
}

impl Default for Gain {
    fn default() -> Self {
        Self { volume: 1.0, mute: false }
    }
}

impl Gain {
    #[allow(clippy::float_cmp)]
    fn is_silent(self) -> bool {
        self.mute || self.volume == 0.0
    }

    #[allow(clippy::float_cmp)]
    fn is_unity(self) -> bool {
        self.volume == 1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMixer {
    U8,
    S16Le,
    S32Le,
    F32,
    F64,
}

impl SampleMixer {
    pub const fn for_format(format: SampleFormat) -> Self {
        match format {
            SampleFormat::U8 => Self::U8,
            SampleFormat::S16Le => Self::S16Le,
            SampleFormat::S32Le => Self::S32Le,
            SampleFormat::F32 => Self::F32,
            SampleFormat::F64 => Self::F64,
        }
    }

    /// Adds `count` frames of `input` (from frame `in_offset`) onto `output` (from frame `out_offset`).
    ///
    /// Returns `false` when nothing was written (muted or zero volume).
    #[allow(clippy::too_many_arguments)]
    pub fn mix(
        self,
        input: &[u8],
        in_offset: usize,
        output: &mut [u8],
        out_offset: usize,
        count: usize,
        bpf: usize,
        gain: Gain,
    ) -> bool {
        if gain.is_silent() || count == 0 {
            return false;
        }

        let input = &input[in_offset * bpf..(in_offset + count) * bpf];
        let output = &mut output[out_offset * bpf..(out_offset + count) * bpf];

        match self {
            Self::U8 => mix_u8(input, output, gain),
            Self::S16Le => mix_s16(input, output, gain),
            Self::S32Le => mix_s32(input, output, gain),
            Self::F32 => mix_f32(input, output, gain),
            Self::F64 => mix_f64(input, output, gain),
        }
        true
    }
}

#[allow(clippy::cast_possible_truncation)]
fn scaled(sample: i64, gain: Gain) -> i64 {
    if gain.is_unity() {
        sample
    } else {
        #[allow(clippy::cast_precision_loss)]
        let v = (sample as f64 * gain.volume).round();
        v as i64
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn mix_u8(input: &[u8], output: &mut [u8], gain: Gain) {
    for (out, &inp) in output.iter_mut().zip(input) {
        let sum = (i64::from(*out) - 128) + scaled(i64::from(inp) - 128, gain);
        *out = (sum.clamp(-128, 127) + 128) as u8;
    }
}

#[allow(clippy::cast_possible_truncation)]
fn mix_s16(input: &[u8], output: &mut [u8], gain: Gain) {
    for (out, inp) in output.chunks_exact_mut(2).zip(input.chunks_exact(2)) {
        let a = i64::from(i16::from_le_bytes([out[0], out[1]]));
        let b = scaled(i64::from(i16::from_le_bytes([inp[0], inp[1]])), gain);
        let sum = (a + b).clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16;
        out.copy_from_slice(&sum.to_le_bytes());
    }
}

#[allow(clippy::cast_possible_truncation)]
fn mix_s32(input: &[u8], output: &mut [u8], gain: Gain) {
    for (out, inp) in output.chunks_exact_mut(4).zip(input.chunks_exact(4)) {
        let a = i64::from(i32::from_le_bytes([out[0], out[1], out[2], out[3]]));
        let b = scaled(i64::from(i32::from_le_bytes([inp[0], inp[1], inp[2], inp[3]])), gain);
        let sum = (a + b).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        out.copy_from_slice(&sum.to_le_bytes());
    }
}

#[allow(clippy::cast_possible_truncation)]
fn mix_f32(input: &[u8], output: &mut [u8], gain: Gain) {
    let volume = gain.volume as f32;
    for (out, inp) in output.chunks_exact_mut(4).zip(input.chunks_exact(4)) {
        let a = f32::from_le_bytes([out[0], out[1], out[2], out[3]]);
        let b = f32::from_le_bytes([inp[0], inp[1], inp[2], inp[3]]);
        out.copy_from_slice(&b.mul_add(volume, a).to_le_bytes());
    }
}

fn mix_f64(input: &[u8], output: &mut [u8], gain: Gain) {
    let mut a = [0u8; 8];
    let mut b = [0u8; 8];
    for (out, inp) in output.chunks_exact_mut(8).zip(input.chunks_exact(8)) {
        a.copy_from_slice(out);
        b.copy_from_slice(inp);
        let sum = f64::from_le_bytes(b).mul_add(gain.volume, f64::from_le_bytes(a));
        out.copy_from_slice(&sum.to_le_bytes());
    }
}
