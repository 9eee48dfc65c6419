use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

use crate::error::{Result, ThrottleError};

pub const DEFAULT_QPS: u32 = 35;

/// Constructor-time options of a throttler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ThrottlerConfig {
    /// Maximum number of transformations started per one-second window
    #[validate(range(min = 1))]
    #[serde(default = "default_qps")]
    pub qps: u32,
}

fn default_qps() -> u32 {
    DEFAULT_QPS
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self { qps: DEFAULT_QPS }
    }
}

impl ThrottlerConfig {
    pub fn new(qps: u32) -> Result<Self> {
        let config = Self { qps };
        config.validate()?;
        Ok(config)
    }
}

/// Settings of the `throttled-transform` binary.
///
/// Values come from command-line flags, falling back to environment
/// variables (a `.env` file is honoured) and then defaults. A JSON file
/// given with `--config` replaces the defaults.
#[derive(Debug, Clone, Parser, Serialize, Deserialize, Validate)]
#[command(name = "throttled-transform", version, about)]
pub struct Config {
    /// Transformations started per second
    #[arg(long, env = "THROTTLER_QPS", default_value_t = DEFAULT_QPS)]
    #[validate(range(min = 1))]
    #[serde(default = "default_qps")]
    pub qps: u32,

    /// Simulated latency of each transformation, e.g. "250ms"
    #[arg(long, env = "THROTTLER_WORK_DELAY", default_value = "100ms", value_parser = parse_delay)]
    #[serde(with = "humantime_serde", default = "default_work_delay")]
    pub work_delay: Duration,

    /// Log level applied to this crate's targets
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional JSON file holding the settings above
    #[arg(long, env = "THROTTLER_CONFIG")]
    #[serde(skip)]
    pub config: Option<PathBuf>,
}

fn default_work_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn parse_delay(raw: &str) -> std::result::Result<Duration, String> {
    #[derive(Deserialize)]
    struct Wrapper(#[serde(with = "humantime_serde")] Duration);

    serde_json::from_value::<Wrapper>(serde_json::Value::String(raw.to_string()))
        .map(|Wrapper(delay)| delay)
        .map_err(|e| format!("invalid duration '{}': {}", raw, e))
}

impl Config {
    /// Parse flags and environment, then apply the JSON file if one was named
    pub fn load() -> anyhow::Result<Self> {
        let cli = Config::parse();
        let config = match cli.config.as_deref() {
            Some(path) => Self::from_file(path)?,
            None => cli,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&raw)?;
        config.config = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn throttler_config(&self) -> Result<ThrottlerConfig> {
        ThrottlerConfig::new(self.qps)
    }
}

impl TryFrom<u32> for ThrottlerConfig {
    type Error = ThrottleError;

    fn try_from(qps: u32) -> Result<Self> {
        ThrottlerConfig::new(qps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_qps() {
        assert_eq!(ThrottlerConfig::default().qps, 35);
        assert!(ThrottlerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_qps_rejected() {
        assert!(matches!(
            ThrottlerConfig::new(0),
            Err(ThrottleError::InvalidConfig(_))
        ));
        assert!(ThrottlerConfig::try_from(1).is_ok());
    }

    #[test]
    fn test_config_deserialization_defaults() {
        let config: ThrottlerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.qps, DEFAULT_QPS);
    }

    #[test]
    fn test_app_config_from_json() {
        let config: Config =
            serde_json::from_str(r#"{"qps": 3, "work_delay": "250ms"}"#).unwrap();
        assert_eq!(config.qps, 3);
        assert_eq!(config.work_delay, Duration::from_millis(250));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.throttler_config().unwrap().qps, 3);
    }

    #[test]
    fn test_cli_parsing() {
        let config = Config::parse_from(["throttled-transform", "--qps", "7", "--work-delay", "2s"]);
        assert_eq!(config.qps, 7);
        assert_eq!(config.work_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_delay() {
        assert!(parse_delay("soon").is_err());
    }
}
