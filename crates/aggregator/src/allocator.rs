// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Silence-filled output buffer factories.

use mixkit_core::{AudioFormat, BufferPool, PooledBytes};

/// Produces silence-filled output storage of `num_frames * bpf` bytes.
///
/// The aggregator owns the result exclusively until it hands the finished
/// buffer downstream.
pub trait OutputBufferAllocator: Send + Sync {
    fn allocate(&self, num_frames: usize, format: &AudioFormat) -> PooledBytes;
}

/// Allocates fresh storage for every block.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilenceAllocator;

impl OutputBufferAllocator for SilenceAllocator {
    fn allocate(&self, num_frames: usize, format: &AudioFormat) -> PooledBytes {
        let mut data = vec![0u8; num_frames * format.bpf()];
        format.sample_format.fill_silence(&mut data);
        PooledBytes::detached(data)
    }
}

/// Reuses storage from a [`BufferPool`]; storage returns to the pool when the
/// last downstream handle to a pushed buffer is dropped.
#[derive(Debug, Clone)]
pub struct PooledAllocator {
    pool: BufferPool,
}

impl PooledAllocator {
    pub const fn new(pool: BufferPool) -> Self {
        Self { pool }
    }

    pub const fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

impl Default for PooledAllocator {
    fn default() -> Self {
        Self::new(BufferPool::audio_default())
    }
}

impl OutputBufferAllocator for PooledAllocator {
    fn allocate(&self, num_frames: usize, format: &AudioFormat) -> PooledBytes {
        let mut data = self.pool.get(num_frames * format.bpf());
        format.sample_format.fill_silence(&mut data);
        data
    }
}
