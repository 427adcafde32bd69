//! Configuration loader and validator for the routing service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
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

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub server: Server,
    pub auth: Auth,
    pub scheduler: Scheduler,
    #[serde(default)]
    pub notifications: Notifications,
    #[serde(default)]
    pub earnings: Earnings,
    #[serde(default)]
    pub orchestration: Orchestration,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

/// HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

/// Static bearer tokens and the role each one grants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Auth {
    pub tokens: Vec<ApiToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiToken {
    pub token: String,
    pub role: Role,
    /// Admin id or driver id the token acts as.
    pub subject: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Driver,
    Cron,
}

/// In-process auto-routing loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    pub enabled: bool,
    pub tick_seconds: u64,
}

/// Driver notification delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notifications {
    /// POST target for "route assigned" events. Notifications are only
    /// logged when unset.
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

/// Payout tuning applied on top of the built-in rate card.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Earnings {
    pub driver_rate_multiplier: f64,
    pub daily_cap_pence: i64,
}

impl Default for Earnings {
    fn default() -> Self {
        Self {
            driver_rate_multiplier: 1.0,
            daily_cap_pence: 50_000,
        }
    }
}

/// Engine limits that are not exposed through the admin settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Orchestration {
    pub booking_horizon_hours: i64,
    pub booking_batch_size: i64,
    pub max_route_weight_kg: f64,
    pub max_route_volume_m3: f64,
    pub max_route_duration_min: i64,
    pub max_driving_distance_km: f64,
    pub min_route_value_pence: i64,
}

impl Default for Orchestration {
    fn default() -> Self {
        Self {
            booking_horizon_hours: 48,
            booking_batch_size: 100,
            max_route_weight_kg: 500.0,
            max_route_volume_m3: 10.0,
            max_route_duration_min: 480,
            max_driving_distance_km: 200.0,
            min_route_value_pence: 10_000,
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return format!("{}/{}", home.trim_end_matches('/'), rest);
            }
        }
        self.data_dir.clone()
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
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.server.host.trim().is_empty() {
        return Err(ConfigError::Invalid("server.host must be non-empty"));
    }
    if cfg.auth.tokens.is_empty() {
        return Err(ConfigError::Invalid("auth.tokens must list at least one token"));
    }
    for token in &cfg.auth.tokens {
        if token.token.trim().len() < 8 {
            return Err(ConfigError::Invalid("auth.tokens[].token must be at least 8 characters"));
        }
        if token.subject.trim().is_empty() {
            return Err(ConfigError::Invalid("auth.tokens[].subject must be non-empty"));
        }
    }
    if cfg.scheduler.enabled && cfg.scheduler.tick_seconds == 0 {
        return Err(ConfigError::Invalid("scheduler.tick_seconds must be > 0"));
    }
    if let Some(url) = &cfg.notifications.webhook_url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid("notifications.webhook_url must be an http(s) URL"));
        }
    }
    let multiplier = cfg.earnings.driver_rate_multiplier;
    if multiplier.is_nan() || multiplier <= 0.0 {
        return Err(ConfigError::Invalid("earnings.driver_rate_multiplier must be > 0"));
    }
    if cfg.earnings.daily_cap_pence <= 0 {
        return Err(ConfigError::Invalid("earnings.daily_cap_pence must be > 0"));
    }
    let o = &cfg.orchestration;
    if o.booking_horizon_hours <= 0 {
        return Err(ConfigError::Invalid("orchestration.booking_horizon_hours must be > 0"));
    }
    if o.booking_batch_size <= 0 {
        return Err(ConfigError::Invalid("orchestration.booking_batch_size must be > 0"));
    }
    if o.max_route_weight_kg <= 0.0 || o.max_route_volume_m3 <= 0.0 {
        return Err(ConfigError::Invalid("orchestration capacity limits must be > 0"));
    }
    if o.max_route_duration_min <= 0 || o.max_driving_distance_km <= 0.0 {
        return Err(ConfigError::Invalid("orchestration duration/distance limits must be > 0"));
    }

    Ok(())
}

/// Example configuration shipped with the service.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 300

server:
  host: "0.0.0.0"
  port: 8080

auth:
  tokens:
    - token: "admin-dev-token"
      role: admin
      subject: "admin_1"
    - token: "cron-dev-token"
      role: cron
      subject: "cron"
    - token: "driver-dev-token"
      role: driver
      subject: "drv_1"

scheduler:
  enabled: true
  tick_seconds: 60

notifications:
  webhook_url: null

earnings:
  driver_rate_multiplier: 1.0
  daily_cap_pence: 50000

orchestration:
  booking_horizon_hours: 48
  booking_batch_size: 100
  max_route_weight_kg: 500
  max_route_volume_m3: 10
  max_route_duration_min: 480
  max_driving_distance_km: 200
  min_route_value_pence: 10000
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
        assert_eq!(cfg.auth.tokens[0].role, Role::Admin);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn optional_sections_default() {
        let yaml = r#"app:
  data_dir: "./data"
  poll_interval_ms: 100
  max_backoff_seconds: 60
server:
  host: "127.0.0.1"
  port: 9000
auth:
  tokens:
    - token: "0123456789"
      role: cron
      subject: "cron"
scheduler:
  enabled: false
  tick_seconds: 0
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.earnings, Earnings::default());
        assert_eq!(cfg.orchestration.booking_horizon_hours, 48);
        assert!(cfg.notifications.webhook_url.is_none());
    }

    #[test]
    fn invalid_tokens() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.auth.tokens.clear();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("auth.tokens")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.auth.tokens[0].token = "short".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.auth.tokens[1].subject = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_scheduler_and_webhook() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.scheduler.tick_seconds = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("tick_seconds")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.notifications.webhook_url = Some("ftp://example.com".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_limits() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.earnings.driver_rate_multiplier = 0.0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.orchestration.max_route_weight_kg = 0.0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.orchestration.booking_batch_size = 0;
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
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.auth.tokens.len(), 3);
        assert!(cfg.scheduler.enabled);
    }
}
