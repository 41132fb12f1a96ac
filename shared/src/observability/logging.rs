//! Structured logging setup for the Detector binaries

use std::str::FromStr;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::{ObservabilityError, ObservabilityResult};

/// Chatty dependencies kept at `warn` unless `RUST_LOG` says otherwise.
const QUIET_TARGETS: &[&str] = &["sqlx"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ObservabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ObservabilityError::Logging(format!("unknown log level '{}'", other))),
        }
    }
}

/// Output format of the log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Console output for an operator
    Pretty,
    /// One JSON object per line for log shipping
    Json,
}

impl FromStr for LogFormat {
    type Err = ObservabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(ObservabilityError::Logging(format!("unknown log format '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
        }
    }
}

impl LogConfig {
    /// Filter directives used when `RUST_LOG` is unset.
    pub fn directives(&self) -> String {
        let mut directives = vec![self.level.as_str().to_string()];
        if self.level < LogLevel::Warn {
            directives.extend(QUIET_TARGETS.iter().map(|target| format!("{}=warn", target)));
        }
        directives.join(",")
    }
}

/// Initialize logging for the process. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: LogConfig) -> ObservabilityResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))
        .map_err(|e| ObservabilityError::Logging(e.to_string()))?;
    // Source locations only matter when debugging.
    let verbose = config.level <= LogLevel::Debug;

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(verbose).with_line_number(verbose))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_line_number(verbose))
            .try_init(),
    };
    installed.map_err(|e| ObservabilityError::Logging(e.to_string()))?;

    tracing::debug!(level = config.level.as_str(), format = ?config.format, "Logging initialized");
    Ok(())
}
