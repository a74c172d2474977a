//! Helpers to configure the log output of a process

use crate::library::EmptyResult;
use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Output format of log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable, multi-line friendly
    Text,
    /// Human readable, more concise
    Compact,
    /// One JSON object per line
    Json,
}

/// Log format name that is not known
#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown log format '{0}', expected one of text, compact or json")]
pub struct UnknownLogFormat(String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => Err(UnknownLogFormat(s.to_owned())),
        }
    }
}

/// Installs a global subscriber printing events matching the filter directives in the given format
pub fn init(filter: &str, format: LogFormat) -> EmptyResult {
    let formatter = tracing_subscriber::fmt().with_env_filter(EnvFilter::try_new(filter)?);

    match format {
        LogFormat::Text => formatter.try_init(),
        LogFormat::Compact => formatter.compact().try_init(),
        LogFormat::Json => formatter.json().try_init(),
    }
}
