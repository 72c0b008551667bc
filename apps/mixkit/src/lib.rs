// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

pub mod cli;
pub mod config;
pub mod logging;
pub mod mix;
pub mod output;
pub mod sources;

pub use config::Config;
pub use mix::{run, MixSummary};
