// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Diagnostic log level for the agent's own logging.
//!
//! Set through `log_level` (`OTT_LOG_LEVEL`) or the `debug: true` shorthand. Invalid values
//! fall back to **WARN**.

use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl AsRef<str> for LogLevel {
    fn as_ref(&self) -> &str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl LogLevel {
    #[must_use]
    pub fn as_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!(
                "Invalid log level: '{s}'. Valid levels are: error, warn, info, debug, trace",
            )),
        }
    }
}

/// Lenient: never fails, logs and falls back to `Warn`.
impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;

        if let Value::String(s) = value {
            match LogLevel::from_str(&s) {
                Ok(level) => Ok(level),
                Err(e) => {
                    error!("{}", e);
                    Ok(LogLevel::Warn)
                }
            }
        } else {
            error!("Expected a string for log level, got {:?}", value);
            Ok(LogLevel::Warn)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!(LogLevel::from_str("DeBuG").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert!(LogLevel::from_str("verbose").is_err());
    }

    #[test]
    fn test_deserialize_falls_back_to_warn() {
        let level: LogLevel = serde_json::from_value(json!("nonsense")).unwrap();
        assert_eq!(level, LogLevel::Warn);
        let level: LogLevel = serde_json::from_value(json!(3)).unwrap();
        assert_eq!(level, LogLevel::Warn);
        let level: LogLevel = serde_json::from_value(json!("trace")).unwrap();
        assert_eq!(level, LogLevel::Trace);
    }

    #[test]
    fn test_level_filter() {
        assert_eq!(LogLevel::Info.as_level_filter(), LevelFilter::INFO);
        assert_eq!(LogLevel::default().as_ref(), "warn");
    }
}
