//! Structured logging setup.
//!
//! Every engine subsystem logs through `tracing` with its module path as
//! the target, so per-component filtering works out of the box:
//!
//! ```bash
//! # debug only the fill pipeline
//! RUST_LOG=gridpong::engine::fills=debug cargo run
//!
//! # warn for everything, debug for the DC engine
//! RUST_LOG=warn,gridpong::engine::dc=debug cargo run
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable format (default for development)
    #[default]
    Pretty,
    /// JSON format (best for log aggregation)
    Json,
    /// Compact single-line format
    Compact,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Directory for rotated log files (when file logging is enabled)
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Write a daily-rotated JSON log file alongside stdout
    #[serde(default)]
    pub enable_file: bool,

    /// Level filter for the file stream
    #[serde(default = "default_file_level")]
    pub file_level: String,

    /// Enable stdout logging (default: true)
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,

    /// Format for stdout logging
    #[serde(default)]
    pub stdout_format: LogFormat,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_file_level() -> String {
    "info".to_string()
}

fn default_enable_stdout() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            enable_file: false,
            file_level: default_file_level(),
            enable_stdout: default_enable_stdout(),
            stdout_format: LogFormat::default(),
        }
    }
}

impl LogConfig {
    /// Config for development: pretty stdout, no files.
    pub fn development() -> Self {
        Self::default()
    }

    /// Config for production: JSON stdout plus a rotated file stream.
    pub fn production(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            enable_file: true,
            stdout_format: LogFormat::Json,
            ..Default::default()
        }
    }
}

/// Initialize the global subscriber.
///
/// Returns worker guards that must stay alive for the life of the program,
/// or buffered file output is lost.
pub fn init_logging(
    config: &LogConfig,
    env_filter_override: Option<&str>,
) -> Result<Vec<WorkerGuard>, Box<dyn std::error::Error>> {
    let mut guards = Vec::new();

    let base_filter = match env_filter_override {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    if config.enable_file {
        std::fs::create_dir_all(&config.log_dir)?;

        let appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "gridpong.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .json()
            .with_filter(EnvFilter::new(&config.file_level));

        match config.stdout_format {
            _ if !config.enable_stdout => {
                tracing_subscriber::registry().with(file_layer).init();
            }
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(file_layer)
                    .with(fmt::layer().json().with_filter(base_filter))
                    .init();
            }
            LogFormat::Compact => {
                tracing_subscriber::registry()
                    .with(file_layer)
                    .with(fmt::layer().compact().with_filter(base_filter))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(file_layer)
                    .with(fmt::layer().with_target(false).with_filter(base_filter))
                    .init();
            }
        }
    } else {
        match config.stdout_format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(fmt::layer().json().with_filter(base_filter))
                    .init();
            }
            LogFormat::Compact => {
                tracing_subscriber::registry()
                    .with(fmt::layer().compact().with_filter(base_filter))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(fmt::layer().with_target(false).with_filter(base_filter))
                    .init();
            }
        }
    }

    Ok(guards)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_stdout_only() {
        let config = LogConfig::default();
        assert!(config.enable_stdout);
        assert!(!config.enable_file);
        assert_eq!(config.stdout_format, LogFormat::Pretty);
    }

    #[test]
    fn production_config_enables_file_stream() {
        let config = LogConfig::production(PathBuf::from("/tmp/logs"));
        assert!(config.enable_file);
        assert_eq!(config.stdout_format, LogFormat::Json);
    }
}
