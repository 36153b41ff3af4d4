//! Configuration loader and validator for the feed mailer.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::model::Cursor;

pub const CONFIG_PATH_ENV_KEY: &str = "FEED_MAILER_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub feed: Feed,
    pub email: Email,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Remote feed settings, plus the dev-only overrides that force run-once mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feed {
    pub host: String,
    pub token: String,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub start_cursor: i64,
    #[serde(default)]
    pub replay_file: Option<PathBuf>,
    #[serde(default)]
    pub since_key: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Email {
    pub from_address: String,
    #[serde(default)]
    pub send_to: Option<String>,
    #[serde(default = "default_timeout")]
    pub delivery_timeout_seconds: u64,
    #[serde(default = "default_concurrency")]
    pub delivery_concurrency: usize,
    #[serde(default)]
    pub temporary_error_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub temporary_error_retry_delay_seconds: u64,
    pub backend: Backend,
}

/// Delivery backend, chosen once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backend {
    Smtp(SmtpBackend),
    Api(ApiBackend),
    Fs(FsBackend),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SmtpBackend {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiBackend {
    pub endpoint: String,
    pub key_id: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FsBackend {
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
}

fn default_batch_limit() -> u32 {
    100
}

fn default_poll_interval() -> u64 {
    60
}

fn default_timeout() -> u64 {
    30
}

fn default_concurrency() -> usize {
    1
}

fn default_retry_delay() -> u64 {
    30
}

fn default_smtp_port() -> u16 {
    25
}

fn default_output_path() -> PathBuf {
    PathBuf::from("output")
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins, then `app.database_url`, then a file under `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.app.database_url.clone())
            .unwrap_or_else(|| {
                format!(
                    "sqlite://{}/feed-mailer.db",
                    self.app.data_dir.trim_end_matches('/')
                )
            })
    }

    /// Feed host without a trailing slash.
    pub fn feed_host(&self) -> &str {
        self.feed.host.trim_end_matches('/')
    }

    pub fn start_cursor(&self) -> Cursor {
        Cursor(self.feed.start_cursor)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.feed.poll_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.feed.request_timeout_seconds)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.email.delivery_timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.email.temporary_error_retry_delay_seconds)
    }

    /// Dev overrides (replay file or a fixed start key) run a single tick.
    pub fn is_run_once(&self) -> bool {
        self.feed.replay_file.is_some() || self.feed.since_key.is_some()
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `$FEED_MAILER_CONFIG` or `config.yaml`.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let env_path = std::env::var_os(CONFIG_PATH_ENV_KEY).map(PathBuf::from);
    let path = path
        .map(Path::to_path_buf)
        .or(env_path)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    let content = fs::read_to_string(&path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.feed.replay_file.is_none() {
        if cfg.feed.host.trim().is_empty() {
            return Err(ConfigError::Invalid("feed.host must be non-empty"));
        }
        if cfg.feed.token.trim().is_empty() {
            return Err(ConfigError::Invalid("feed.token must be non-empty"));
        }
    }
    if cfg.feed.batch_limit == 0 {
        return Err(ConfigError::Invalid("feed.batch_limit must be > 0"));
    }
    if cfg.feed.poll_interval_seconds == 0 {
        return Err(ConfigError::Invalid("feed.poll_interval_seconds must be > 0"));
    }
    if cfg.feed.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("feed.request_timeout_seconds must be > 0"));
    }
    if cfg.feed.start_cursor < 0 {
        return Err(ConfigError::Invalid("feed.start_cursor must be >= 0"));
    }

    if cfg.email.from_address.trim().is_empty() {
        return Err(ConfigError::Invalid("email.from_address must be non-empty"));
    }
    if cfg.email.delivery_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("email.delivery_timeout_seconds must be > 0"));
    }
    if cfg.email.delivery_concurrency == 0 {
        return Err(ConfigError::Invalid("email.delivery_concurrency must be > 0"));
    }

    match &cfg.email.backend {
        Backend::Smtp(smtp) => {
            if smtp.host.trim().is_empty() {
                return Err(ConfigError::Invalid("email.backend.host must be non-empty"));
            }
        }
        Backend::Api(api) => {
            if api.endpoint.trim().is_empty() {
                return Err(ConfigError::Invalid("email.backend.endpoint must be non-empty"));
            }
            if api.key_id.trim().is_empty() || api.secret.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "email.backend.key_id and email.backend.secret must be non-empty",
                ));
            }
        }
        Backend::Fs(fs_backend) => {
            if fs_backend.output_path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("email.backend.output_path must be non-empty"));
            }
        }
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  log_format: compact

feed:
  host: "https://phabricator.example.com/"
  token: "api-xxxxxxxxxxxxxxxxxxxxxxxxxxxx"
  batch_limit: 100
  poll_interval_seconds: 60
  request_timeout_seconds: 30
  start_cursor: 0

email:
  from_address: "phabricator@example.com"
  delivery_timeout_seconds: 30
  delivery_concurrency: 1
  temporary_error_retries: 0
  temporary_error_retry_delay_seconds: 30
  backend:
    kind: smtp
    host: "localhost"
    port: 25
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = sample();
        validate(&cfg).unwrap();
        assert_eq!(cfg.feed_host(), "https://phabricator.example.com");
        assert_eq!(cfg.app.log_format, LogFormat::Compact);
        assert!(matches!(cfg.email.backend, Backend::Smtp(ref s) if s.port == 25));
        assert!(!cfg.is_run_once());
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let yaml = r#"
app:
  data_dir: "./data"
feed:
  host: "https://tracker"
  token: "t"
email:
  from_address: "from@mail"
  backend:
    kind: fs
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.feed.batch_limit, 100);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(60));
        assert_eq!(cfg.email.delivery_concurrency, 1);
        assert_eq!(cfg.start_cursor(), Cursor::START);
        match cfg.email.backend {
            Backend::Fs(fs_backend) => assert_eq!(fs_backend.output_path, PathBuf::from("output")),
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn api_backend_requires_credentials() {
        let mut cfg = sample();
        cfg.email.backend = Backend::Api(ApiBackend {
            endpoint: "https://mail.example.com/send".into(),
            key_id: "id".into(),
            secret: "".into(),
        });
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("secret")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_feed_settings() {
        let mut cfg = sample();
        cfg.feed.token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("feed.token")),
            _ => panic!("wrong error"),
        }

        let mut cfg = sample();
        cfg.feed.poll_interval_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = sample();
        cfg.feed.batch_limit = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = sample();
        cfg.email.delivery_concurrency = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn replay_file_skips_remote_credentials() {
        let mut cfg = sample();
        cfg.feed.host = "".into();
        cfg.feed.token = "".into();
        cfg.feed.replay_file = Some(PathBuf::from("events.json"));
        validate(&cfg).unwrap();
        assert!(cfg.is_run_once());
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = sample();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.email.from_address, "phabricator@example.com");
    }
}
