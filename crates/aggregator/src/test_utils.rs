// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Test utilities for aggregator testing

#![allow(clippy::unwrap_used)]

use crate::downstream::Downstream;
use mixkit_core::{AudioBuffer, FlowError};
use std::sync::Mutex;

/// Interleaved little-endian S16 samples.
pub fn s16_buffer(samples: &[i16]) -> AudioBuffer {
    AudioBuffer::new(samples.iter().flat_map(|s| s.to_le_bytes()).collect::<Vec<u8>>())
}

/// Interleaved little-endian F32 samples.
pub fn f32_buffer(samples: &[f32]) -> AudioBuffer {
    AudioBuffer::new(samples.iter().flat_map(|s| s.to_le_bytes()).collect::<Vec<u8>>())
}

pub fn read_s16(buffer: &AudioBuffer) -> Vec<i16> {
    buffer.data.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect()
}

pub fn read_f32(buffer: &AudioBuffer) -> Vec<f32> {
    buffer.data.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

/// Downstream that records every pushed buffer, optionally failing on demand.
#[derive(Default)]
pub struct CollectingDownstream {
    buffers: Mutex<Vec<AudioBuffer>>,
    fail: Mutex<Option<FlowError>>,
    eos: Mutex<bool>,
}

impl CollectingDownstream {
    /// Drains the buffers pushed so far.
    pub fn take(&self) -> Vec<AudioBuffer> {
        std::mem::take(&mut *self.buffers.lock().unwrap())
    }

    /// Makes every following push fail with `error`.
    pub fn fail_with(&self, error: FlowError) {
        *self.fail.lock().unwrap() = Some(error);
    }

    pub fn saw_eos(&self) -> bool {
        *self.eos.lock().unwrap()
    }
}

impl Downstream for CollectingDownstream {
    fn push(&self, buffer: AudioBuffer) -> Result<(), FlowError> {
        if let Some(error) = self.fail.lock().unwrap().clone() {
            return Err(error);
        }
        self.buffers.lock().unwrap().push(buffer);
        Ok(())
    }

    fn end_of_stream(&self) {
        *self.eos.lock().unwrap() = true;
    }
}
