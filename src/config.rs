//! Configuration loader and validator for the inbox→SMS relay.
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

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub gmail: Gmail,
    pub classifier: Classifier,
    pub sms: Sms,
    pub identity: Identity,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub bind_addr: String,
    pub task_poll_interval_ms: u64,
    pub task_delay_ms: u64,
    pub refresh_interval_hours: u64,
}

/// Gmail push-subscription settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gmail {
    pub pubsub_topic: String,
}

/// Language-model classification settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Classifier {
    pub api_key: String,
    pub model: String,
}

/// Twilio SMS settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sms {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub country_code: String,
}

/// Identity-provider settings (session resolution + Google OAuth tokens).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub base_url: String,
    pub secret_key: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
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
    if cfg.app.bind_addr.trim().is_empty() {
        return Err(ConfigError::Invalid("app.bind_addr must be non-empty"));
    }
    if cfg.app.task_poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.task_poll_interval_ms must be > 0"));
    }
    if cfg.app.refresh_interval_hours == 0 {
        return Err(ConfigError::Invalid("app.refresh_interval_hours must be > 0"));
    }

    if cfg.gmail.pubsub_topic.trim().is_empty() {
        return Err(ConfigError::Invalid("gmail.pubsub_topic must be non-empty"));
    }

    if cfg.classifier.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("classifier.api_key must be non-empty"));
    }
    if cfg.classifier.model.trim().is_empty() {
        return Err(ConfigError::Invalid("classifier.model must be non-empty"));
    }

    if cfg.sms.account_sid.trim().is_empty() {
        return Err(ConfigError::Invalid("sms.account_sid must be non-empty"));
    }
    if cfg.sms.auth_token.trim().is_empty() {
        return Err(ConfigError::Invalid("sms.auth_token must be non-empty"));
    }
    if cfg.sms.from_number.trim().is_empty() {
        return Err(ConfigError::Invalid("sms.from_number must be non-empty"));
    }
    if !cfg.sms.country_code.starts_with('+') {
        return Err(ConfigError::Invalid("sms.country_code must start with '+'"));
    }

    if cfg.identity.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("identity.base_url must be non-empty"));
    }
    if cfg.identity.secret_key.trim().is_empty() {
        return Err(ConfigError::Invalid("identity.secret_key must be non-empty"));
    }

    Ok(())
}

/// Example YAML configuration, also used by tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  bind_addr: "0.0.0.0:8080"
  task_poll_interval_ms: 500
  task_delay_ms: 10
  refresh_interval_hours: 84

gmail:
  pubsub_topic: "projects/YOUR_PROJECT/topics/gmail-push"

classifier:
  api_key: "YOUR_LLM_API_KEY"
  model: "gpt-4o-mini"

sms:
  account_sid: "YOUR_TWILIO_ACCOUNT_SID"
  auth_token: "YOUR_TWILIO_AUTH_TOKEN"
  from_number: "+15550000000"
  country_code: "+1"

identity:
  base_url: "https://api.your-identity-provider.com"
  secret_key: "YOUR_IDENTITY_SECRET_KEY"
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
    }

    #[test]
    fn invalid_classifier_key() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.classifier.api_key = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("classifier.api_key")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_sms_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sms.account_sid = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("account_sid")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sms.country_code = "1".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("country_code")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_timers() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.task_poll_interval_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.refresh_interval_hours = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_identity_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.identity.base_url = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.identity.secret_key = "".into();
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
        assert_eq!(cfg.sms.country_code, "+1");
    }
}
