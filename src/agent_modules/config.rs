use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::connectivity::{ProbeSettings, Quorum, StrategyKind};
use super::pause_window::PauseWindow;
use super::retry::RetryPolicy;
use super::session::{Credentials, SessionSettings, Viewport};

pub const DEFAULT_CONFIG_PATH: &str = "keeper.toml";

const DEFAULT_PORTAL_URL: &str = "http://172.29.0.2";
const DEFAULT_CARRIER_SUFFIX: &str = "@cmcc";
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 240;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 1000;
const DEFAULT_MAX_ATTEMPTS: u64 = 3;
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 5;
const DEFAULT_SESSION_TIMEOUT_MS: u64 = 8000;
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_LOG_DIR: &str = "logs";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file at {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// A loosely typed configuration value.
///
/// Environment variables always arrive as text while TOML may carry numbers,
/// booleans or arrays; every field is coerced when the final config is built.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum RawValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl RawValue {
    fn as_text(&self) -> String {
        match self {
            RawValue::Bool(b) => b.to_string(),
            RawValue::Int(i) => i.to_string(),
            RawValue::Float(f) => f.to_string(),
            RawValue::Text(s) => s.trim().to_string(),
            RawValue::List(items) => items.join(","),
        }
    }

    fn as_integer(&self) -> Option<i64> {
        match self {
            RawValue::Int(i) => Some(*i),
            RawValue::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            RawValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            RawValue::Bool(b) => Some(*b),
            RawValue::Int(i) => Some(*i != 0),
            RawValue::Text(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    fn as_list(&self) -> Vec<String> {
        let items: Vec<String> = match self {
            RawValue::List(items) => items.clone(),
            RawValue::Text(s) => s.split(',').map(str::to_string).collect(),
            other => vec![other.as_text()],
        };
        items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    }
}

/// One configuration layer. Key names double as environment variable names
/// (upper-cased), so the same struct reads both the TOML file and the environment.
#[derive(Deserialize, Default, Debug, Clone)]
#[serde(default)]
pub struct PartialMonitorConfig {
    pub campus_username: Option<RawValue>,
    pub campus_password: Option<RawValue>,
    pub campus_isp: Option<RawValue>,
    pub campus_auth_url: Option<RawValue>,
    pub monitor_interval: Option<RawValue>,
    pub ping_targets: Option<RawValue>,
    pub probe_timeout_ms: Option<RawValue>,
    pub probe_strategies: Option<RawValue>,
    pub probe_require_all: Option<RawValue>,
    pub pause_login_enabled: Option<RawValue>,
    pub pause_login_start_hour: Option<RawValue>,
    pub pause_login_end_hour: Option<RawValue>,
    pub retry_max_retries: Option<RawValue>,
    pub retry_interval: Option<RawValue>,
    pub browser_headless: Option<RawValue>,
    pub browser_timeout: Option<RawValue>,
    pub browser_user_agent: Option<RawValue>,
    pub log_level: Option<RawValue>,
    pub log_dir: Option<RawValue>,
}

impl PartialMonitorConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_vars(std::env::vars())
    }

    /// Reads a layer from `(NAME, value)` pairs; unrelated names are ignored.
    pub fn from_env_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::from_iter::<_, PartialMonitorConfig>(vars)?)
    }

    /// Values present in `self` win over `fallback`.
    pub fn or(self, fallback: Self) -> Self {
        Self {
            campus_username: self.campus_username.or(fallback.campus_username),
            campus_password: self.campus_password.or(fallback.campus_password),
            campus_isp: self.campus_isp.or(fallback.campus_isp),
            campus_auth_url: self.campus_auth_url.or(fallback.campus_auth_url),
            monitor_interval: self.monitor_interval.or(fallback.monitor_interval),
            ping_targets: self.ping_targets.or(fallback.ping_targets),
            probe_timeout_ms: self.probe_timeout_ms.or(fallback.probe_timeout_ms),
            probe_strategies: self.probe_strategies.or(fallback.probe_strategies),
            probe_require_all: self.probe_require_all.or(fallback.probe_require_all),
            pause_login_enabled: self.pause_login_enabled.or(fallback.pause_login_enabled),
            pause_login_start_hour: self
                .pause_login_start_hour
                .or(fallback.pause_login_start_hour),
            pause_login_end_hour: self.pause_login_end_hour.or(fallback.pause_login_end_hour),
            retry_max_retries: self.retry_max_retries.or(fallback.retry_max_retries),
            retry_interval: self.retry_interval.or(fallback.retry_interval),
            browser_headless: self.browser_headless.or(fallback.browser_headless),
            browser_timeout: self.browser_timeout.or(fallback.browser_timeout),
            browser_user_agent: self.browser_user_agent.or(fallback.browser_user_agent),
            log_level: self.log_level.or(fallback.log_level),
            log_dir: self.log_dir.or(fallback.log_dir),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub dir: String,
}

/// Immutable settings for one monitoring run.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub credentials: Credentials,
    pub portal_url: String,
    pub probe: ProbeSettings,
    pub check_interval: Duration,
    pub pause_window: PauseWindow,
    pub retry: RetryPolicy,
    pub session: SessionSettings,
    pub log: LogSettings,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_partial(PartialMonitorConfig::default())
    }
}

fn text_or(raw: Option<&RawValue>, default: &str) -> String {
    raw.map(RawValue::as_text)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn positive_or(field: &'static str, raw: Option<&RawValue>, default: u64) -> u64 {
    let Some(value) = raw else { return default };
    match value.as_integer() {
        Some(n) if n >= 1 => n as u64,
        _ => {
            warn!(field, value = ?value, default, "Invalid numeric setting; using default.");
            default
        }
    }
}

fn hour_or(field: &'static str, raw: Option<&RawValue>, default: u32) -> u32 {
    let Some(value) = raw else { return default };
    match value.as_integer() {
        Some(h) if (0..=23).contains(&h) => h as u32,
        _ => {
            warn!(field, value = ?value, default, "Hour must be within 0-23; using default.");
            default
        }
    }
}

fn bool_or(field: &'static str, raw: Option<&RawValue>, default: bool) -> bool {
    let Some(value) = raw else { return default };
    value.as_bool().unwrap_or_else(|| {
        warn!(field, value = ?value, default, "Invalid boolean setting; using default.");
        default
    })
}

fn strategies_from(raw: Option<&RawValue>) -> Vec<StrategyKind> {
    let mut kinds = Vec::new();
    if let Some(value) = raw {
        for name in value.as_list() {
            match name.parse::<StrategyKind>() {
                Ok(kind) if !kinds.contains(&kind) => kinds.push(kind),
                Ok(_) => {}
                Err(e) => warn!(strategy = %name, error = %e, "Ignoring unknown probe strategy."),
            }
        }
    }
    if kinds.is_empty() {
        kinds = vec![StrategyKind::Tcp, StrategyKind::Http];
    }
    kinds
}

impl MonitorConfig {
    /// Loads `.env`, the optional TOML file and the environment; the
    /// environment overrides the file. Missing credentials are not an error
    /// here, see [`MonitorConfig::validate`].
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let path = Path::new(config_path.unwrap_or(DEFAULT_CONFIG_PATH));
        let file_config = if path.exists() {
            info!(path = ?path, "Loading config file.");
            PartialMonitorConfig::from_file(path)?
        } else {
            if config_path.is_some() {
                warn!(path = ?path, "Config file not found; using environment and defaults.");
            }
            PartialMonitorConfig::default()
        };

        let env_config = PartialMonitorConfig::from_env()?;
        let config = Self::from_partial(env_config.or(file_config));
        info!(config = ?config, "Loaded config successfully.");
        Ok(config)
    }

    /// Builds the final config, coercing invalid or missing values to defaults.
    pub fn from_partial(partial: PartialMonitorConfig) -> Self {
        let p = partial;

        let credentials = Credentials {
            username: text_or(p.campus_username.as_ref(), ""),
            password: text_or(p.campus_password.as_ref(), ""),
            carrier_suffix: p
                .campus_isp
                .as_ref()
                .map(RawValue::as_text)
                .unwrap_or_else(|| DEFAULT_CARRIER_SUFFIX.to_string()),
        };

        let probe = ProbeSettings {
            targets: p.ping_targets.as_ref().map(RawValue::as_list).unwrap_or_default(),
            timeout: Duration::from_millis(positive_or(
                "probe_timeout_ms",
                p.probe_timeout_ms.as_ref(),
                DEFAULT_PROBE_TIMEOUT_MS,
            )),
            strategies: strategies_from(p.probe_strategies.as_ref()),
            quorum: if bool_or("probe_require_all", p.probe_require_all.as_ref(), false) {
                Quorum::All
            } else {
                Quorum::Any
            },
        };

        let defaults = PauseWindow::default();
        let pause_window = PauseWindow {
            enabled: bool_or("pause_login_enabled", p.pause_login_enabled.as_ref(), defaults.enabled),
            start_hour: hour_or(
                "pause_login_start_hour",
                p.pause_login_start_hour.as_ref(),
                defaults.start_hour,
            ),
            end_hour: hour_or(
                "pause_login_end_hour",
                p.pause_login_end_hour.as_ref(),
                defaults.end_hour,
            ),
        };

        let max_attempts = positive_or(
            "retry_max_retries",
            p.retry_max_retries.as_ref(),
            DEFAULT_MAX_ATTEMPTS,
        );
        let retry = RetryPolicy {
            max_attempts: u32::try_from(max_attempts).unwrap_or(u32::MAX),
            base_interval: Duration::from_secs(positive_or(
                "retry_interval",
                p.retry_interval.as_ref(),
                DEFAULT_RETRY_INTERVAL_SECS,
            )),
        };

        let session = SessionSettings {
            headless: bool_or("browser_headless", p.browser_headless.as_ref(), false),
            timeout: Duration::from_millis(positive_or(
                "browser_timeout",
                p.browser_timeout.as_ref(),
                DEFAULT_SESSION_TIMEOUT_MS,
            )),
            user_agent: text_or(p.browser_user_agent.as_ref(), DEFAULT_USER_AGENT),
            viewport: Viewport::default(),
        };

        MonitorConfig {
            credentials,
            portal_url: text_or(p.campus_auth_url.as_ref(), DEFAULT_PORTAL_URL),
            probe,
            check_interval: Duration::from_secs(positive_or(
                "monitor_interval",
                p.monitor_interval.as_ref(),
                DEFAULT_CHECK_INTERVAL_SECS,
            )),
            pause_window,
            retry,
            session,
            log: LogSettings {
                level: text_or(p.log_level.as_ref(), DEFAULT_LOG_LEVEL),
                dir: text_or(p.log_dir.as_ref(), DEFAULT_LOG_DIR),
            },
        }
    }

    /// Checks what monitoring cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let username = self.credentials.username.trim();
        let password = self.credentials.password.trim();
        if username.is_empty() {
            return Err(ConfigError::Missing("CAMPUS_USERNAME"));
        }
        if password.is_empty() {
            return Err(ConfigError::Missing("CAMPUS_PASSWORD"));
        }
        if username.chars().count() < 2 {
            return Err(ConfigError::Invalid {
                field: "campus_username",
                reason: "must be at least 2 characters".to_string(),
            });
        }
        if password.chars().count() < 2 {
            return Err(ConfigError::Invalid {
                field: "campus_password",
                reason: "must be at least 2 characters".to_string(),
            });
        }

        let url = reqwest::Url::parse(&self.portal_url).map_err(|e| ConfigError::Invalid {
            field: "campus_auth_url",
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                field: "campus_auth_url",
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        Ok(())
    }
}
