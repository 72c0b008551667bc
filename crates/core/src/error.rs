// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for MixKit.
//!
//! Aggregation failures fall into a small number of categories: format
//! negotiation problems, unsupported playback modes, configuration mistakes
//! and flow errors reported by the downstream consumer. Routine conditions
//! such as "need more data" are not errors and never show up here.

use thiserror::Error;

/// Flow result reported by a downstream consumer or a producer push.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// The pad or aggregator is flushing; the data was discarded.
    #[error("flushing")]
    Flushing,

    /// Nothing is connected downstream.
    #[error("not linked")]
    NotLinked,

    /// Downstream does not accept any more data.
    #[error("end of stream")]
    Eos,

    /// Any other downstream failure.
    #[error("{0}")]
    Error(String),
}

/// Main error type for MixKit operations.
#[derive(Debug, Error)]
pub enum MixKitError {
    /// Configuration or parameter validation error.
    ///
    /// Examples:
    /// - Output buffer duration with a zero denominator
    /// - Volume outside the accepted range
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Stream format error.
    ///
    /// Raised when the output format is unknown when a cycle needs it, when a pad
    /// carries data with an invalid format, or when a converter cannot be built.
    /// Fatal to the current cycle; recoverable once a valid format is negotiated.
    #[error("Not negotiated: {0}")]
    NotNegotiated(String),

    /// Requested behavior is not supported (e.g. negative playback rates).
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Flow error propagated verbatim from the downstream consumer.
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    /// Runtime processing error during normal operation.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O error (file output, thread spawning).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MixKitError {
    /// Returns true for stream format errors.
    pub const fn is_not_negotiated(&self) -> bool {
        matches!(self, Self::NotNegotiated(_))
    }
}

/// Convenience type alias for Results using `MixKitError`.
pub type Result<T> = std::result::Result<T, MixKitError>;

impl From<MixKitError> for String {
    fn from(err: MixKitError) -> Self {
        err.to_string()
    }
}

// Generic string errors default to Runtime
impl From<String> for MixKitError {
    fn from(s: String) -> Self {
        Self::Runtime(s)
    }
}

impl From<&str> for MixKitError {
    fn from(s: &str) -> Self {
        Self::Runtime(s.to_string())
    }
}
