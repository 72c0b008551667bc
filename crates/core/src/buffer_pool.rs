// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Byte storage pooling for output buffers.
//!
//! - fixed size buckets (by byte count)
//! - bounded number of idle buffers per bucket
//! - [`PooledBytes`] returns its storage to the pool on drop, including after
//!   it was frozen into a shared [`Bytes`] handle and the last handle went away
//!
//! The aggregator allocates one output block per cycle, so recycling that
//! storage keeps the steady state allocation-free.

use bytes::Bytes;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub buckets: Vec<BucketStats>,
}

#[derive(Debug, Clone)]
pub struct BucketStats {
    pub bucket_size: usize,
    pub available: usize,
    pub max_per_bucket: usize,
}

struct PoolInner {
    bucket_sizes: Vec<usize>,
    max_per_bucket: usize,
    buckets: Vec<Vec<Vec<u8>>>,
    hits: u64,
    misses: u64,
}

impl PoolInner {
    fn bucket_for_len(&self, min_len: usize) -> Option<usize> {
        self.bucket_sizes.iter().position(|&size| size >= min_len)
    }
}

/// Thread-safe pool of byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool").finish_non_exhaustive()
    }
}

impl BufferPool {
    /// Create a pool with fixed buckets (sorted and deduplicated here).
    pub fn with_buckets(mut bucket_sizes: Vec<usize>, max_per_bucket: usize) -> Self {
        bucket_sizes.sort_unstable();
        bucket_sizes.dedup();
        let buckets = bucket_sizes.iter().map(|_| Vec::new()).collect();
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                bucket_sizes,
                max_per_bucket,
                buckets,
                hits: 0,
                misses: 0,
            })),
        }
    }

    /// Buckets sized for common output blocks (10ms/20ms/40ms of 48kHz stereo at up to 8 bytes per sample).
    pub fn audio_default() -> Self {
        Self::with_buckets(DEFAULT_OUTPUT_BUCKET_SIZES.to_vec(), DEFAULT_BUFFERS_PER_BUCKET)
    }

    pub fn stats(&self) -> PoolStats {
        let Ok(guard) = self.inner.lock() else {
            return PoolStats { hits: 0, misses: 0, buckets: Vec::new() };
        };
        PoolStats {
            hits: guard.hits,
            misses: guard.misses,
            buckets: guard
                .bucket_sizes
                .iter()
                .zip(&guard.buckets)
                .map(|(&bucket_size, bucket)| BucketStats {
                    bucket_size,
                    available: bucket.len(),
                    max_per_bucket: guard.max_per_bucket,
                })
                .collect(),
        }
    }

    /// Get storage for exactly `len` bytes.
    ///
    /// Lengths larger than every bucket get a detached allocation.
    /// The content of recycled storage is unspecified; callers fill it.
    pub fn get(&self, len: usize) -> PooledBytes {
        let Ok(mut guard) = self.inner.lock() else {
            return PooledBytes::detached(vec![0; len]);
        };
        let Some(idx) = guard.bucket_for_len(len) else {
            guard.misses += 1;
            return PooledBytes::detached(vec![0; len]);
        };
        let bucket_size = guard.bucket_sizes[idx];
        let recycled = guard.buckets[idx].pop();
        if recycled.is_some() {
            guard.hits += 1;
        } else {
            guard.misses += 1;
        }
        drop(guard);

        let data = recycled.unwrap_or_else(|| vec![0; bucket_size]);
        PooledBytes { data, len, pool: Some(Arc::downgrade(&self.inner)), bucket_idx: idx }
    }
}

pub const DEFAULT_OUTPUT_BUCKET_SIZES: &[usize] = &[1920, 3840, 7680, 15360];
pub const DEFAULT_BUFFERS_PER_BUCKET: usize = 8;

/// Byte storage with a logical length, returned to its pool on drop.
pub struct PooledBytes {
    data: Vec<u8>,
    len: usize,
    pool: Option<Weak<Mutex<PoolInner>>>,
    bucket_idx: usize,
}

impl std::fmt::Debug for PooledBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBytes")
            .field("len", &self.len)
            .field("storage_len", &self.data.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl PooledBytes {
    pub fn detached(data: Vec<u8>) -> Self {
        let len = data.len();
        Self { data, len, pool: None, bucket_idx: 0 }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrinks the logical length; never grows past the storage.
    pub fn truncate(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// Turns the storage into a shared, immutable handle.
    ///
    /// Pooled storage goes back to the pool once every clone of the handle is dropped.
    pub fn freeze(self) -> Bytes {
        if self.pool.is_none() {
            let mut this = self;
            let len = this.len;
            let mut data = std::mem::take(&mut this.data);
            data.truncate(len);
            return Bytes::from(data);
        }
        Bytes::from_owner(self)
    }
}

impl AsRef<[u8]> for PooledBytes {
    fn as_ref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl Deref for PooledBytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data[..self.len]
    }
}

impl DerefMut for PooledBytes {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data[..self.len]
    }
}

impl Drop for PooledBytes {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else { return };
        let Some(inner) = pool.upgrade() else { return };
        let Ok(mut guard) = inner.lock() else { return };

        let idx = self.bucket_idx;
        if guard.bucket_sizes.get(idx) != Some(&self.data.len()) {
            return;
        }
        if guard.buckets[idx].len() >= guard.max_per_bucket {
            return;
        }
        guard.buckets[idx].push(std::mem::take(&mut self.data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_bytes_return_to_pool_on_last_drop() {
        let pool = BufferPool::with_buckets(vec![16], 2);
        assert_eq!(pool.stats().buckets[0].available, 0);

        let mut buf = pool.get(10);
        assert_eq!(buf.len(), 10);
        buf.fill(7);
        let bytes = buf.freeze();
        let clone = bytes.clone();
        assert_eq!(&clone[..], &[7u8; 10]);

        drop(bytes);
        assert_eq!(pool.stats().buckets[0].available, 0);
        drop(clone);
        assert_eq!(pool.stats().buckets[0].available, 1);

        let again = pool.get(12);
        assert_eq!(again.len(), 12);
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn oversized_requests_are_detached() {
        let pool = BufferPool::with_buckets(vec![4], 1);
        let buf = pool.get(100);
        assert_eq!(buf.len(), 100);
        assert_eq!(pool.stats().misses, 1);
        let bytes = buf.freeze();
        assert_eq!(bytes.len(), 100);
        drop(bytes);
        assert_eq!(pool.stats().buckets[0].available, 0);
    }

    #[test]
    fn truncate_limits_the_frozen_view() {
        let pool = BufferPool::with_buckets(vec![8], 1);
        let mut buf = pool.get(8);
        buf.fill(1);
        buf.truncate(3);
        assert_eq!(buf.freeze().len(), 3);
    }
}
