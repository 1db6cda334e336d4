//! Configuration loader and validator for the Serializd→Discord relay.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub discord: Discord,
    pub serializd: Serializd,
}

/// App-level settings for the poll cycle and dispatch pacing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Scheduler wake interval. Must be within 1..=60.
    pub poll_interval_minutes: u64,
    /// Upper bound on simultaneous upstream fetches per cycle.
    pub fetch_concurrency: usize,
    /// Initial-history window for freshly added users.
    pub backfill_hours: u64,
    /// Pagination cap per user per cycle.
    pub max_pages_per_cycle: u32,
    pub request_timeout_seconds: u64,
    pub fetch_retry_max_attempts: u32,
    pub fetch_retry_base_delay_ms: u64,
    pub fetch_retry_max_delay_ms: u64,
    /// Minimum spacing between consecutive sends to one destination.
    pub send_spacing_ms: u64,
    pub send_retry_max_attempts: u32,
}

/// Discord bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Discord {
    pub bot_token: String,
}

/// Upstream diary service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Serializd {
    pub base_url: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.app.poll_interval_minutes * 60)
    }

    pub fn backfill_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.app.backfill_hours as i64)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_minutes == 0 || cfg.app.poll_interval_minutes > 60 {
        return Err(ConfigError::Invalid(
            "app.poll_interval_minutes must be within 1..=60",
        ));
    }
    if cfg.app.fetch_concurrency == 0 {
        return Err(ConfigError::Invalid("app.fetch_concurrency must be > 0"));
    }
    if cfg.app.backfill_hours == 0 {
        return Err(ConfigError::Invalid("app.backfill_hours must be > 0"));
    }
    if cfg.app.max_pages_per_cycle == 0 {
        return Err(ConfigError::Invalid("app.max_pages_per_cycle must be > 0"));
    }
    if cfg.app.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "app.request_timeout_seconds must be > 0",
        ));
    }
    if cfg.app.fetch_retry_max_attempts == 0 {
        return Err(ConfigError::Invalid(
            "app.fetch_retry_max_attempts must be > 0",
        ));
    }
    if cfg.app.fetch_retry_max_delay_ms < cfg.app.fetch_retry_base_delay_ms {
        return Err(ConfigError::Invalid(
            "app.fetch_retry_max_delay_ms must be >= app.fetch_retry_base_delay_ms",
        ));
    }
    if cfg.app.send_retry_max_attempts == 0 {
        return Err(ConfigError::Invalid(
            "app.send_retry_max_attempts must be > 0",
        ));
    }

    if cfg.discord.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("discord.bot_token must be non-empty"));
    }

    if cfg.serializd.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("serializd.base_url must be non-empty"));
    }

    Ok(())
}

/// Example YAML configuration, used by docs and tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_minutes: 5
  fetch_concurrency: 4
  backfill_hours: 24
  max_pages_per_cycle: 5
  request_timeout_seconds: 15
  fetch_retry_max_attempts: 4
  fetch_retry_base_delay_ms: 2000
  fetch_retry_max_delay_ms: 60000
  send_spacing_ms: 1200
  send_retry_max_attempts: 3

discord:
  bot_token: "YOUR_DISCORD_BOT_TOKEN"

serializd:
  base_url: "https://www.serializd.com"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.poll_interval_minutes, 5);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(300));
    }

    #[test]
    fn invalid_bot_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.discord.bot_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("discord.bot_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn poll_interval_bounds() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.poll_interval_minutes = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.poll_interval_minutes = 61;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.poll_interval_minutes = 60;
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_retry_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.fetch_retry_max_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.fetch_retry_max_delay_ms = cfg.app.fetch_retry_base_delay_ms - 1;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        let mut f = fs::File::create(&p).unwrap();
        f.write_all(example().as_bytes()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.serializd.base_url, "https://www.serializd.com");
    }
}
