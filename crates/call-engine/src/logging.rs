use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingSection;
use crate::error::{CallEngineError, Result};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// The log level to use
    pub level: Level,
    /// Whether to enable JSON formatting
    pub json: bool,
    /// Whether to include file and line information
    pub file_info: bool,
    /// Whether to log spans
    pub log_spans: bool,
    /// Application name to include in logs
    pub app_name: String,
}

impl LoggingConfig {
    /// Build from the `logging` section of the service configuration
    pub fn from_section(section: &LoggingSection, app_name: impl Into<String>) -> Result<Self> {
        Ok(LoggingConfig {
            level: parse_log_level(&section.level)?,
            json: section.json,
            file_info: section.file_info,
            log_spans: section.log_spans,
            app_name: app_name.into(),
        })
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` directives are honoured; the configured level is added on top.
/// Fails if a global subscriber is already installed.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let span_events = if config.log_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        builder.json().with_current_span(config.log_spans).try_init()
    } else {
        builder.with_target(true).try_init()
    };
    installed.map_err(|e| CallEngineError::configuration(format!("logging setup failed: {}", e)))?;

    tracing::info!("🚀 Starting {} v{}", config.app_name, env!("CARGO_PKG_VERSION"));
    Ok(())
}

pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level.trim())
        .map_err(|_| CallEngineError::configuration(format!("Invalid log level: {}", level)))
}
