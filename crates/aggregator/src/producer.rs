// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use mixkit_core::AudioBuffer;

/// The consumer side of a producer connection, as seen by the aggregation cycle.
///
/// Buffers are handed out strictly in producer order. `peek_buffer` never
/// blocks and never consumes; the head is only removed by `drop_buffer`.
pub trait Producer: Send + Sync {
    /// True once the producer signalled end-of-stream and every queued buffer was consumed.
    fn is_eos(&self) -> bool;

    /// Returns the head buffer without removing it.
    fn peek_buffer(&self) -> Option<AudioBuffer>;

    /// Removes the head buffer.
    fn drop_buffer(&self);

    /// Inactive producers are skipped entirely by the cycle.
    fn is_inactive(&self) -> bool;
}
