// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use mixkit_aggregator::{AggregatorConfig, PadConfig};
use mixkit_core::{AudioFormat, ClockTime, SampleFormat};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::Level;

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log output format for file logging.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (faster, lower CPU overhead)
    #[default]
    Text,
    /// JSON format (structured, better for log aggregation)
    Json,
}

#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LogConfig {
    #[serde(default)]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default)]
    pub file_path: String,
    /// Format for file logging: "text" (default) or "json" (structured)
    #[serde(default)]
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: false,
            console_level: LogLevel::default(),
            // Per-cycle logs at debug are very chatty with 10ms blocks
            file_level: LogLevel::Info,
            file_path: "./mixkit.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

const DEFAULT_FORMAT: AudioFormat = AudioFormat::new(48_000, 2, SampleFormat::S16Le);

const fn default_output_format() -> AudioFormat {
    DEFAULT_FORMAT
}

const fn default_channel_capacity() -> usize {
    32
}

/// Where and how the mixed stream is written.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct OutputConfig {
    /// Destination file for raw interleaved PCM in `format`.
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_output_format")]
    pub format: AudioFormat,
    /// Output buffers held between the aggregation thread and the file writer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: "./mixkit.raw".to_string(),
            format: default_output_format(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

const fn default_frequency() -> f64 {
    440.0
}

const fn default_amplitude() -> f64 {
    0.5
}

const fn default_buffer_ms() -> u64 {
    10
}

const fn default_volume() -> f64 {
    1.0
}

/// A synthetic sine tone attached to its own pad.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct SourceConfig {
    pub name: String,
    /// Tone frequency in Hz.
    #[serde(default = "default_frequency")]
    pub frequency: f64,
    /// Peak amplitude relative to full scale (0.0 - 1.0).
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
    /// Format the source produces. Defaults to the output format; a
    /// different layout or sample format is converted while mixing.
    pub format: Option<AudioFormat>,
    /// Timestamp of the first buffer.
    #[serde(default)]
    pub start_ms: u64,
    /// Total tone length. Unset runs until the mix is cancelled.
    pub duration_ms: Option<u64>,
    /// Length of each pushed buffer.
    #[serde(default = "default_buffer_ms")]
    pub buffer_ms: u64,
    /// Pace buffers in real time and make the mix operate on deadlines.
    #[serde(default)]
    pub live: bool,
    #[serde(default = "default_volume")]
    pub volume: f64,
    #[serde(default)]
    pub mute: bool,
}

impl SourceConfig {
    pub fn pad_config(&self) -> PadConfig {
        PadConfig {
            volume: self.volume,
            mute: self.mute,
            qos_messages: true,
            live: self.live,
            converter: None,
        }
    }

    pub fn start(&self) -> ClockTime {
        ClockTime::from_mseconds(self.start_ms)
    }
}

fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig {
            name: "a4".to_string(),
            frequency: 440.0,
            amplitude: 0.4,
            format: None,
            start_ms: 0,
            duration_ms: Some(2_000),
            buffer_ms: default_buffer_ms(),
            live: false,
            volume: 1.0,
            mute: false,
        },
        SourceConfig {
            name: "e5".to_string(),
            frequency: 659.25,
            amplitude: 0.3,
            format: Some(AudioFormat::new(48_000, 1, SampleFormat::F32)),
            start_ms: 500,
            duration_ms: Some(1_000),
            buffer_ms: 20,
            live: false,
            volume: 1.0,
            mute: false,
        },
    ]
}

/// Root configuration structure for mixkit.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            aggregator: AggregatorConfig::default(),
            output: OutputConfig::default(),
            sources: default_sources(),
        }
    }
}

impl Config {
    /// The aggregator settings with the output format pinned to `[output].format`.
    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig { output_format: Some(self.output.format), ..self.aggregator.clone() }
    }

    /// The format a source produces.
    pub fn source_format(&self, source: &SourceConfig) -> AudioFormat {
        source.format.unwrap_or(self.output.format)
    }

    /// Checks settings that cannot be expressed through types alone.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.aggregator_config().validate()?;
        if self.output.path.is_empty() {
            anyhow::bail!("output.path must not be empty");
        }
        if self.output.channel_capacity == 0 {
            anyhow::bail!("output.channel_capacity must be > 0");
        }
        if self.sources.is_empty() {
            anyhow::bail!("at least one source is required");
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                anyhow::bail!("duplicate source name '{}'", source.name);
            }
            if source.frequency.is_nan() || source.frequency <= 0.0 {
                anyhow::bail!("source '{}': frequency must be > 0", source.name);
            }
            if !(0.0..=1.0).contains(&source.amplitude) {
                anyhow::bail!("source '{}': amplitude must be within 0.0..=1.0", source.name);
            }
            if source.buffer_ms == 0 {
                anyhow::bail!("source '{}': buffer_ms must be > 0", source.name);
            }
            source.pad_config().validate()?;

            let format = self.source_format(source);
            if !format.is_valid() {
                anyhow::bail!("source '{}': invalid format {format}", source.name);
            }
            if format.sample_rate != self.output.format.sample_rate {
                anyhow::bail!(
                    "source '{}': sample rate {} differs from output rate {}",
                    source.name,
                    format.sample_rate,
                    self.output.format.sample_rate
                );
            }
        }
        Ok(())
    }

    /// True when any source is live or the aggregator is forced live.
    pub fn is_live(&self) -> bool {
        self.aggregator.force_live || self.sources.iter().any(|s| s.live)
    }
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads the application configuration from defaults, a TOML file, and environment variables.
///
/// Environment variables use the `MK_` prefix and `__` as the nesting separator,
/// e.g. `MK_AGGREGATOR__FORCE_LIVE=true`.
///
/// # Errors
///
/// Returns an error if:
/// - The configuration file exists but contains invalid TOML syntax
/// - Environment variables are set but contain invalid values
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(Config::default()));

    let mut file_missing = None;

    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: Config =
        figment.merge(Env::prefixed("MK_").split("__")).extract().map_err(Box::new)?;

    Ok(ConfigLoadResult { config, file_missing })
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized to TOML.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&Config::default())
}
