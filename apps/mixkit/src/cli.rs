// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::{Parser, Subcommand};
use schemars::schema_for;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config;
use crate::mix;

type LogInitFn = fn(
    &config::LogConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "mixkit.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mixes the configured sources into the output file
    Mix,
    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Generate a default config file and print it to stdout
    Default,
    /// Generate a JSON schema for the config and print it to stdout
    Schema,
}

fn log_startup_info(config: &config::Config) {
    info!(
        output_path = %config.output.path,
        output_format = %config.output.format,
        sources = config.sources.len(),
        live = config.is_live(),
        console_level = ?config.log.console_level,
        file_enable = config.log.file_enable,
        "Starting mixkit"
    );
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl-C, stopping mix"),
                    Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
                }
                token.cancel();
            }
            () = token.cancelled() => {}
        }
    });
}

/// Handle the "mix" command
/// Exits the process on error with status code 1
// Allow eprintln before logging is initialized (CLI output)
#[allow(clippy::disallowed_macros)]
async fn handle_mix_command(config_path: &str, init_logging: LogInitFn) {
    let config_result = match config::load(config_path) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        },
    };

    let _log_guard = match init_logging(&config_result.config.log) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            std::process::exit(1);
        },
    };

    if let Some(missing_file) = &config_result.file_missing {
        warn!(config_path = %missing_file, "Config file not found, using defaults");
    }

    log_startup_info(&config_result.config);

    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());

    match mix::run(&config_result.config, token.clone()).await {
        Ok(summary) => {
            let stats = summary.stats.unwrap_or_default();
            info!(
                stop_reason = ?summary.stop_reason,
                path = %summary.output.path.display(),
                buffers = summary.output.buffers,
                gap_buffers = summary.output.gap_buffers,
                bytes = summary.output.bytes,
                cycles = stats.cycles,
                timeouts = stats.timeouts,
                need_data = stats.need_data,
                dropped_frames = summary.dropped_frames,
                "Mix finished"
            );
            for (source, frames) in &summary.source_frames {
                info!(%source, frames, "Source summary");
            }
        },
        Err(e) => {
            error!(error = %e, "Mix failed");
            token.cancel();
            std::process::exit(1);
        },
    }
    token.cancel();
}

/// Handle the "config default" command - print default config to stdout
// Allow println for CLI output to stdout (intentional)
#[allow(clippy::disallowed_macros)]
fn handle_config_default_command() {
    match config::generate_default() {
        Ok(toml_string) => {
            println!("# Default mixkit configuration file");
            println!("{toml_string}");
        },
        Err(e) => {
            eprintln!("Failed to generate default config: {e}");
            std::process::exit(1);
        },
    }
}

/// Handle the "config schema" command - print JSON schema to stdout
// Allow println for CLI output to stdout (intentional)
#[allow(clippy::disallowed_macros)]
fn handle_config_schema_command() {
    let schema = schema_for!(config::Config);
    match serde_json::to_string_pretty(&schema) {
        Ok(json) => {
            println!("{json}");
        },
        Err(e) => {
            eprintln!("Failed to generate config schema: {e}");
            std::process::exit(1);
        },
    }
}

/// Handle CLI commands
pub async fn handle_command(cli: &Cli, init_logging: LogInitFn) {
    match cli.command.as_ref().unwrap_or(&Commands::Mix) {
        Commands::Mix => {
            handle_mix_command(&cli.config, init_logging).await;
        },
        Commands::Config(ConfigCommands::Default) => {
            handle_config_default_command();
        },
        Commands::Config(ConfigCommands::Schema) => {
            handle_config_schema_command();
        },
    }
}
