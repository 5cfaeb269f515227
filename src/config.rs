// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clients::http::{HttpSettings, RetryPolicy};
use crate::error::ConfigFault;
use crate::sync::cadence::Cadence;
use crate::sync::types::LocationFilter;

pub const ENV_CONFIG_PATH: &str = "POSTING_SYNC_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub environment: String,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub models: ModelsConfig,
    pub services: ServicesConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: "develop".into(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            models: ModelsConfig::default(),
            services: ServicesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// "compact" | "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "compact".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub postings: PostingsModelConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostingsModelConfig {
    pub schedule: ScheduleConfig,
    pub polling: PollingConfig,
    /// Attempts per removal record.
    pub max_retry_count: u32,
}

impl Default for PostingsModelConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleConfig::default(),
            polling: PollingConfig::default(),
            max_retry_count: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: "every 5 minutes".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub location: LocationConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    pub metro: String,
    pub state: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub feed: FeedServiceConfig,
    pub postings: PostingsServiceConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedServiceConfig {
    pub url: String,
    pub api_key: String,
    pub strict_ssl: bool,
    pub timeout_ms: u64,
    pub max_retry_count: u32,
    pub retry_backoff_ms: u64,
}

impl Default for FeedServiceConfig {
    fn default() -> Self {
        Self {
            url: "https://polling.3taps.com".into(),
            api_key: String::new(),
            strict_ssl: true,
            timeout_ms: 30_000,
            max_retry_count: 5,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostingsServiceConfig {
    pub url: String,
    /// Prefix of store-side record ids, e.g. `3taps:<id>`.
    pub source: String,
    pub strict_ssl: bool,
    pub timeout_ms: u64,
    pub max_retry_count: u32,
    pub max_bulk_upsert_count: usize,
    pub retry_backoff_ms: u64,
}

impl Default for PostingsServiceConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:4043/v1/postings".into(),
            source: "3taps".into(),
            strict_ssl: true,
            timeout_ms: 30_000,
            max_retry_count: 5,
            max_bulk_upsert_count: 1_000,
            retry_backoff_ms: 500,
        }
    }
}

impl FeedServiceConfig {
    pub fn http(&self) -> HttpSettings {
        HttpSettings {
            timeout: Duration::from_millis(self.timeout_ms),
            strict_tls: self.strict_ssl,
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retry_count)
            .with_backoff(Duration::from_millis(self.retry_backoff_ms))
    }
}

impl PostingsServiceConfig {
    pub fn http(&self) -> HttpSettings {
        HttpSettings {
            timeout: Duration::from_millis(self.timeout_ms),
            strict_tls: self.strict_ssl,
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retry_count)
            .with_backoff(Duration::from_millis(self.retry_backoff_ms))
    }
}

impl AppConfig {
    /// Parse a TOML config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load config using env var + fallbacks, then apply env overrides:
    /// 1) $POSTING_SYNC_CONFIG_PATH
    /// 2) config/default.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            Self::load_from(&pb)?
        } else {
            let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_p.exists() {
                Self::load_from(&default_p)?
            } else {
                Self::default()
            }
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigFault>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("ENVIRONMENT") {
            self.environment = v;
        }
        if let Some(v) = get("LOGGING_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("SERVER_PORT") {
            self.server.port = parse_num("server.port", &v)?;
        }

        let metro = get("MODELS_POSTINGS_POLLING_LOCATION_METRO");
        let state = get("MODELS_POSTINGS_POLLING_LOCATION_STATE");
        let location = &mut self.models.postings.polling.location;
        match (metro, state) {
            (Some(_), Some(_)) => return Err(ConfigFault::Location),
            (Some(m), None) => {
                location.metro = m;
                location.state.clear();
            }
            (None, Some(s)) => {
                location.state = s;
                location.metro.clear();
            }
            (None, None) => {}
        }

        if let Some(v) = get("MODELS_POSTINGS_SCHEDULE_INTERVAL") {
            self.models.postings.schedule.interval = v;
        }
        if let Some(v) = get("SERVICES_FEED_APIKEY") {
            self.services.feed.api_key = v;
        }
        if let Some(v) = get("SERVICES_FEED_STRICTSSL") {
            self.services.feed.strict_ssl = parse_bool("services.feed.strict_ssl", &v)?;
        }
        if let Some(v) = get("SERVICES_FEED_URL") {
            self.services.feed.url = v;
        }
        if let Some(v) = get("SERVICES_POSTINGS_MAX_BULK_UPSERT_COUNT") {
            self.services.postings.max_bulk_upsert_count =
                parse_num("services.postings.max_bulk_upsert_count", &v)?;
        }
        if let Some(v) = get("SERVICES_POSTINGS_STRICTSSL") {
            self.services.postings.strict_ssl = parse_bool("services.postings.strict_ssl", &v)?;
        }
        if let Some(v) = get("SERVICES_POSTINGS_URL") {
            self.services.postings.url = v;
        }
        Ok(())
    }

    pub fn location(&self) -> Result<LocationFilter, ConfigFault> {
        let l = &self.models.postings.polling.location;
        LocationFilter::from_parts(Some(&l.metro), Some(&l.state))
    }

    pub fn cadence(&self) -> Result<Cadence, ConfigFault> {
        Cadence::parse(&self.models.postings.schedule.interval)
    }

    /// Everything the engine needs at startup, checked once.
    pub fn validate(&self) -> Result<(), ConfigFault> {
        self.location()?;
        self.cadence()?;
        if self.services.feed.url.trim().is_empty() {
            return Err(ConfigFault::Missing("services.feed.url"));
        }
        if self.services.postings.url.trim().is_empty() {
            return Err(ConfigFault::Missing("services.postings.url"));
        }
        if self.services.postings.max_bulk_upsert_count == 0 {
            return Err(ConfigFault::Invalid {
                key: "services.postings.max_bulk_upsert_count",
                message: "must be at least 1".into(),
            });
        }
        if self.services.feed.timeout_ms == 0 || self.services.postings.timeout_ms == 0 {
            return Err(ConfigFault::Invalid {
                key: "services.*.timeout_ms",
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(key: &'static str, v: &str) -> Result<T, ConfigFault> {
    v.trim().parse().map_err(|_| ConfigFault::Invalid {
        key,
        message: format!("{v:?} is not a number"),
    })
}

fn parse_bool(key: &'static str, v: &str) -> Result<bool, ConfigFault> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigFault::Invalid {
            key,
            message: format!("{v:?} is not a boolean"),
        }),
    }
}
