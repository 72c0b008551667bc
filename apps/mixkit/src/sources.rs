// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Synthetic tone producers, one thread per configured source.

use std::f64::consts::TAU;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mixkit_aggregator::{encode_sample, InputPad};
use mixkit_core::{AudioBuffer, AudioFormat, ClockTime, FlowError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;

/// Sine generator writing interleaved samples in any supported format.
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    format: AudioFormat,
    frequency: f64,
    amplitude: f64,
    frames: u64,
}

impl ToneGenerator {
    pub const fn new(format: AudioFormat, frequency: f64, amplitude: f64) -> Self {
        Self { format, frequency, amplitude, frames: 0 }
    }

    /// Produces the next `frames` frames, continuing the phase of the previous block.
    #[allow(clippy::cast_precision_loss)]
    pub fn next_block(&mut self, frames: usize) -> Vec<u8> {
        let width = self.format.sample_format.width();
        let mut data = vec![0u8; frames * self.format.bpf()];
        let step = TAU * self.frequency / f64::from(self.format.sample_rate);

        for (i, frame) in data.chunks_exact_mut(self.format.bpf()).enumerate() {
            let phase = step * (self.frames + i as u64) as f64;
            let value = (self.amplitude * phase.sin()).clamp(-1.0, 1.0);
            for sample in frame.chunks_exact_mut(width) {
                encode_sample(self.format.sample_format, value, sample);
            }
        }
        self.frames += frames as u64;
        data
    }
}

/// A running source thread.
pub struct SourceHandle {
    name: String,
    thread: JoinHandle<u64>,
}

impl SourceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the thread and returns the number of frames it pushed.
    pub fn join(self) -> u64 {
        self.thread.join().unwrap_or_else(|_| {
            warn!(source = %self.name, "Source thread panicked");
            0
        })
    }
}

/// Spawns a thread that feeds a tone into `pad` until the configured duration
/// elapses, the pad stops accepting data, or `cancellation_token` fires.
///
/// # Errors
///
/// Returns an error when the thread cannot be spawned.
pub fn spawn_source(
    source: &SourceConfig,
    format: AudioFormat,
    pad: Arc<InputPad>,
    cancellation_token: CancellationToken,
) -> anyhow::Result<SourceHandle> {
    let name = source.name.clone();
    let source = source.clone();
    let thread = std::thread::Builder::new()
        .name(format!("mixkit-source-{name}"))
        .spawn(move || run_source(&source, format, &pad, &cancellation_token))?;
    Ok(SourceHandle { name, thread })
}

fn run_source(
    source: &SourceConfig,
    format: AudioFormat,
    pad: &InputPad,
    cancellation_token: &CancellationToken,
) -> u64 {
    let rate = format.sample_rate;
    let frames_per_buffer = ClockTime::from_mseconds(source.buffer_ms).to_frames(rate).max(1);
    let total_frames = source.duration_ms.map(|ms| ClockTime::from_mseconds(ms).to_frames(rate));
    let mut generator = ToneGenerator::new(format, source.frequency, source.amplitude);
    let started = Instant::now();
    let mut produced = 0u64;

    info!(
        source = %source.name,
        %format,
        frequency = source.frequency,
        live = source.live,
        "Source started"
    );

    while !cancellation_token.is_cancelled() {
        let frames = match total_frames {
            Some(total) => frames_per_buffer.min(total.saturating_sub(produced)),
            None => frames_per_buffer,
        };
        if frames == 0 {
            break;
        }

        let pts = source.start() + ClockTime::from_frames(produced, rate);
        if source.live {
            // Release each buffer once the clock reaches its timestamp.
            let due = started + Duration::from(pts);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let buffer = AudioBuffer::new(generator.next_block(frames as usize))
            .with_pts(pts)
            .with_duration(ClockTime::from_frames(frames, rate));

        match pad.push(buffer) {
            Ok(()) => produced += frames,
            Err(FlowError::Flushing) => {
                debug!(source = %source.name, "Pad flushing, stopping source");
                break;
            },
            Err(e) => {
                warn!(source = %source.name, error = %e, "Pad rejected buffer, stopping source");
                break;
            },
        }
    }

    pad.end_of_stream();
    info!(
        source = %source.name,
        frames = produced,
        duration = %ClockTime::from_frames(produced, rate),
        "Source finished"
    );
    produced
}
