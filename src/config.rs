//! Configuration loader and validator for the pod request scheduler.
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
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub requests: Requests,
    pub transport: Transport,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Settings shared by every request scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Requests {
    pub interval_ms: u64,
    pub requests_in_parallel: usize,
    pub dispatch_timeout_ms: u64,
    /// 0 disables per-pod backoff.
    pub max_backoff_seconds: u64,
    pub qadu: Limits,
}

/// Fan-out bounds of one scheduler kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Limits {
    pub limit_pods: u32,
    pub limit_per_pod: u32,
}

/// Outbound HTTP settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transport {
    pub scheme: String,
    pub user_agent: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// SQLite URL, `DATABASE_URL` wins over `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/scheduler.db", self.app.data_dir))
    }
}

impl Requests {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
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
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let req = &cfg.requests;
    if req.interval_ms == 0 {
        return Err(ConfigError::Invalid("requests.interval_ms must be > 0"));
    }
    if req.requests_in_parallel == 0 {
        return Err(ConfigError::Invalid("requests.requests_in_parallel must be > 0"));
    }
    if req.dispatch_timeout_ms == 0 {
        return Err(ConfigError::Invalid("requests.dispatch_timeout_ms must be > 0"));
    }
    if req.qadu.limit_pods == 0 {
        return Err(ConfigError::Invalid("requests.qadu.limit_pods must be > 0"));
    }
    if req.qadu.limit_per_pod == 0 {
        return Err(ConfigError::Invalid("requests.qadu.limit_per_pod must be > 0"));
    }

    match cfg.transport.scheme.as_str() {
        "http" | "https" => {}
        _ => return Err(ConfigError::Invalid("transport.scheme must be http or https")),
    }
    if cfg.transport.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid("transport.user_agent must be non-empty"));
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

requests:
  interval_ms: 600000
  requests_in_parallel: 10
  dispatch_timeout_ms: 30000
  max_backoff_seconds: 3600
  qadu:
    limit_pods: 10
    limit_per_pod: 10

transport:
  scheme: "https"
  user_agent: "pod-request-scheduler/0.1"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.requests.interval(), Duration::from_secs(600));
        assert_eq!(cfg.requests.qadu.limit_pods, 10);
    }

    #[test]
    fn invalid_interval() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.requests.interval_ms = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("interval_ms")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_limits() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.requests.qadu.limit_pods = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("limit_pods")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.requests.qadu.limit_per_pod = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.requests.requests_in_parallel = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_transport() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.transport.scheme = "ftp".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("transport.scheme")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.transport.user_agent = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_backoff_is_allowed() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.requests.max_backoff_seconds = 0;
        validate(&cfg).unwrap();
        assert_eq!(cfg.requests.max_backoff(), Duration::ZERO);
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
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.transport.scheme, "https");
    }
}
