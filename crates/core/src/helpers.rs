// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Helpers for parsing opaque structured configuration.
//!
//! Per-pad converter settings reach the converter factory as raw JSON so that
//! alternative converters can define their own schema.

/// Helper functions for parsing configuration from JSON values.
pub mod config_helpers {
    use crate::error::MixKitError;
    use serde::Deserialize;

    /// Parses configuration from an optional JSON value, using defaults if not provided.
    ///
    /// # Errors
    ///
    /// Returns `MixKitError::Configuration` if a value is present but does not match `T`.
    pub fn parse_config_optional<T>(params: Option<&serde_json::Value>) -> Result<T, MixKitError>
    where
        T: for<'de> Deserialize<'de> + Default,
    {
        match params {
            None | Some(serde_json::Value::Null) => Ok(T::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| MixKitError::Configuration(format!("Failed to parse config: {e}"))),
        }
    }
}
