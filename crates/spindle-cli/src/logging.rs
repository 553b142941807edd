//! Logging setup for the `spindle` binary.
//!
//! Everything goes to stderr: in `spindle worker` stdout carries the pool
//! protocol.
//!
//! # Environment Variables
//!
//! - `SPINDLE_LOG` - filter directives (overrides `RUST_LOG`)
//! - `SPINDLE_LOG_LEVEL` - error, warn, info, debug, trace
//! - `SPINDLE_LOG_FORMAT` - pretty, compact, json
//! - `RUST_LOG` - fallback filter

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const ENV_LOG: &str = "SPINDLE_LOG";
pub const ENV_LOG_LEVEL: &str = "SPINDLE_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "SPINDLE_LOG_FORMAT";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "unknown log format '{s}' (expected pretty, compact or json)"
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Filter directives; wins over `level` when set.
    pub filter: Option<String>,
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            filter: None,
            show_target: true,
        }
    }
}

impl LogConfig {
    /// Worker processes: compact, warnings only unless overridden.
    pub fn for_worker() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Apply `SPINDLE_*` / `RUST_LOG` overrides. A filter or format already set
    /// from the command line is kept.
    pub fn with_env_overrides(self, format_from_cli: bool) -> Self {
        self.apply_overrides(format_from_cli, |key| std::env::var(key).ok())
    }

    fn apply_overrides(
        mut self,
        format_from_cli: bool,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        if self.filter.is_none() {
            self.filter = lookup(ENV_LOG).or_else(|| lookup("RUST_LOG"));
        }

        if self.filter.is_none()
            && let Some(level) = lookup(ENV_LOG_LEVEL).as_deref().and_then(parse_level)
        {
            self.level = level;
        }

        if !format_from_cli
            && let Some(format) = lookup(ENV_LOG_FORMAT).and_then(|f| f.parse().ok())
        {
            self.format = format;
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("warning: invalid log filter '{filter}', using default");
                fallback()
            }),
            None => fallback(),
        }
    }
}

pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(config.show_target)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(config.show_target)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(config.show_target)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[rstest]
    #[case("pretty", LogFormat::Pretty)]
    #[case("full", LogFormat::Pretty)]
    #[case("COMPACT", LogFormat::Compact)]
    #[case("json", LogFormat::Json)]
    fn parses_formats(#[case] input: &str, #[case] expected: LogFormat) {
        assert_eq!(input.parse::<LogFormat>(), Ok(expected));
    }

    #[test]
    fn rejects_unknown_format() {
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn spindle_log_wins_over_rust_log() {
        let config = LogConfig::default().apply_overrides(
            false,
            env(&[(ENV_LOG, "spindle_core=debug"), ("RUST_LOG", "trace")]),
        );
        assert_eq!(config.filter.as_deref(), Some("spindle_core=debug"));
    }

    #[test]
    fn level_applies_only_without_filter() {
        let config =
            LogConfig::default().apply_overrides(false, env(&[(ENV_LOG_LEVEL, "debug")]));
        assert_eq!(config.level, Level::DEBUG);

        let config = LogConfig::default().apply_overrides(
            false,
            env(&[("RUST_LOG", "warn"), (ENV_LOG_LEVEL, "debug")]),
        );
        assert_eq!(config.level, Level::INFO);
    }

    #[test]
    fn cli_format_is_kept() {
        let config = LogConfig::default()
            .with_format(LogFormat::Compact)
            .apply_overrides(true, env(&[(ENV_LOG_FORMAT, "json")]));
        assert_eq!(config.format, LogFormat::Compact);

        let config = LogConfig::default().apply_overrides(false, env(&[(ENV_LOG_FORMAT, "json")]));
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn worker_preset_is_quiet() {
        let config = LogConfig::for_worker();
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, LogFormat::Compact);
    }
}
