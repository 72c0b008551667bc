// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pluggable capabilities handed to an [`Aggregator`](crate::Aggregator) at construction.
//!
//! Every aggregator owns its own registry, so independent instances can use
//! different converters or allocation strategies side by side.

use crate::allocator::{OutputBufferAllocator, PooledAllocator};
use crate::converter::{FormatConverter, SampleConverter};
use mixkit_core::{AudioFormat, MixKitError};
use std::sync::Arc;

/// Builds a converter from a pad's format to the output format.
///
/// The third argument is the pad's opaque converter configuration.
pub type ConverterFactory = Arc<
    dyn Fn(
            &AudioFormat,
            &AudioFormat,
            Option<&serde_json::Value>,
        ) -> Result<Box<dyn FormatConverter>, MixKitError>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct AggregatorRegistry {
    converter_factory: ConverterFactory,
    allocator: Arc<dyn OutputBufferAllocator>,
}

impl std::fmt::Debug for AggregatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorRegistry").finish_non_exhaustive()
    }
}

impl Default for AggregatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregatorRegistry {
    /// [`SampleConverter`] for conversion, [`PooledAllocator`] for output storage.
    pub fn new() -> Self {
        Self {
            converter_factory: Arc::new(|input, output, params| {
                Ok(Box::new(SampleConverter::new(input, output, params)?) as Box<dyn FormatConverter>)
            }),
            allocator: Arc::new(PooledAllocator::default()),
        }
    }

    #[must_use]
    pub fn with_converter_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(
                &AudioFormat,
                &AudioFormat,
                Option<&serde_json::Value>,
            ) -> Result<Box<dyn FormatConverter>, MixKitError>
            + Send
            + Sync
            + 'static,
    {
        self.converter_factory = Arc::new(factory);
        self
    }

    #[must_use]
    pub fn with_allocator(mut self, allocator: Arc<dyn OutputBufferAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// # Errors
    ///
    /// Whatever the factory reports; the default factory fails with
    /// `MixKitError::NotNegotiated` for unconvertible format pairs.
    pub fn create_converter(
        &self,
        input: &AudioFormat,
        output: &AudioFormat,
        params: Option<&serde_json::Value>,
    ) -> Result<Box<dyn FormatConverter>, MixKitError> {
        (self.converter_factory)(input, output, params)
    }

    pub fn allocator(&self) -> &dyn OutputBufferAllocator {
        self.allocator.as_ref()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::allocator::SilenceAllocator;
    use mixkit_core::SampleFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn default_registry_builds_sample_converters() {
        let registry = AggregatorRegistry::new();
        let s16 = AudioFormat::new(48_000, 2, SampleFormat::S16Le);
        let f32 = AudioFormat::new(48_000, 2, SampleFormat::F32);

        assert!(registry.create_converter(&s16, &s16, None).unwrap().is_passthrough());
        assert!(!registry.create_converter(&s16, &f32, None).unwrap().is_passthrough());

        let other_rate = AudioFormat::new(44_100, 2, SampleFormat::S16Le);
        let err = registry.create_converter(&s16, &other_rate, None).err().expect("rate mismatch");
        assert!(err.is_not_negotiated());
    }

    #[test]
    fn custom_factory_is_used() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = AggregatorRegistry::new()
            .with_allocator(Arc::new(SilenceAllocator))
            .with_converter_factory(move |input, output, params| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(SampleConverter::new(input, output, params)?) as Box<dyn FormatConverter>)
            });

        let format = AudioFormat::new(8_000, 1, SampleFormat::U8);
        registry.create_converter(&format, &format, None).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.allocator().allocate(2, &format).len(), 2);
    }
}
