// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use mixkit_core::{AudioBuffer, FlowError};
use tokio::sync::mpsc;

/// Consumer of finished output buffers.
///
/// Any error is fatal to the cycle that produced the buffer; the aggregator
/// never retries a push.
pub trait Downstream: Send + Sync {
    /// # Errors
    ///
    /// Returns the consumer's flow error verbatim.
    fn push(&self, buffer: AudioBuffer) -> Result<(), FlowError>;

    /// Called once after the final buffer.
    fn end_of_stream(&self) {}
}

/// Forwards output buffers into a bounded tokio channel.
///
/// Pushes block while the channel is full, so this must be driven from a
/// plain thread (as the aggregation driver does), never from async code.
#[derive(Debug, Clone)]
pub struct ChannelDownstream {
    tx: mpsc::Sender<AudioBuffer>,
}

impl ChannelDownstream {
    pub const fn new(tx: mpsc::Sender<AudioBuffer>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AudioBuffer>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

impl Downstream for ChannelDownstream {
    fn push(&self, buffer: AudioBuffer) -> Result<(), FlowError> {
        self.tx.blocking_send(buffer).map_err(|_| FlowError::NotLinked)
    }
}
