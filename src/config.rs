//! Runtime configuration.
//!
//! Loaded from a TOML file (every field optional, see [`Config::default`])
//! and then overridden from the environment. `main` loads `.env` through
//! `dotenv` before the overrides are read, so a deployment can keep its
//! settings either in the TOML file or in `.env`.
//!
//! ```toml
//! base_urls = ["https://sta.colife.org.tw/STA_Rain/v1.0"]
//! timezone = "Asia/Taipei"
//! window_minutes = 20
//!
//! [http]
//! max_attempts = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::catalog::SyncOptions;
use crate::export::ExportFilter;
use crate::ingest::SourceChain;
use crate::ingest::http::{HttpClient, HttpSettings, RetryPolicy};
use crate::ingest::sta::StaSource;
use crate::model::{Metric, SourceError};

/// Config file read when `--config` is not given. Missing is fine.
pub const DEFAULT_CONFIG_PATH: &str = "sta_hydro.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}'")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// SensorThings deployments, in priority order.
    pub base_urls: Vec<String>,
    pub db_path: PathBuf,
    pub output_root: PathBuf,
    /// IANA time zone used for hour boundaries and CSV timestamps.
    pub timezone: String,
    pub window_minutes: u32,
    pub fill_missing_grid: bool,
    /// Exact `authority_type` values to keep on export (empty = all).
    pub allow_authorities: Vec<String>,
    /// Description substrings to keep on export (empty = all).
    pub category_whitelist: Vec<String>,
    /// Metrics that get a header-only file when an hour has no data.
    pub placeholder_metrics: Vec<String>,
    pub api_filter: ApiFilterConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_urls: vec![
                "https://sta.colife.org.tw/STA_Rain/v1.0".to_string(),
                "https://sta.colife.org.tw/STA_WaterResource_v2/v1.0".to_string(),
            ],
            db_path: PathBuf::from("hydro.db"),
            output_root: PathBuf::from("output"),
            timezone: "Asia/Taipei".to_string(),
            window_minutes: 20,
            fill_missing_grid: true,
            allow_authorities: Vec::new(),
            category_whitelist: Vec::new(),
            placeholder_metrics: Metric::ALL.iter().map(|m| m.as_str().to_string()).collect(),
            api_filter: ApiFilterConfig::default(),
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Server-side `$filter` push-down for the catalog datastream walk.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiFilterConfig {
    pub enabled: bool,
    pub authorities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub page_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_secs: 30,
            page_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Reads `path` if given (it must exist), otherwise
    /// [`DEFAULT_CONFIG_PATH`] if present, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        if !required && !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Applies `STA_*` overrides. `lookup` is normally `std::env::var(..).ok()`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("STA_BASE_URLS") {
            self.base_urls = split_list(&v);
        }
        if let Some(v) = get("STA_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("STA_OUTPUT_ROOT") {
            self.output_root = PathBuf::from(v);
        }
        if let Some(v) = get("STA_TIMEZONE") {
            self.timezone = v;
        }
        if let Some(v) = get("STA_WINDOW_MINUTES") {
            self.window_minutes = v
                .parse()
                .map_err(|_| invalid("STA_WINDOW_MINUTES", format!("'{}' is not a number of minutes", v)))?;
        }
        if let Some(v) = get("STA_FILL_MISSING_GRID") {
            self.fill_missing_grid = parse_bool(&v)
                .ok_or_else(|| invalid("STA_FILL_MISSING_GRID", format!("'{}' is not a boolean", v)))?;
        }
        if let Some(v) = get("STA_LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_urls.iter().all(|b| b.trim().is_empty()) {
            return Err(invalid("base_urls", "at least one base URL is required"));
        }
        if let Some(bad) = self
            .base_urls
            .iter()
            .find(|b| !(b.starts_with("http://") || b.starts_with("https://")))
        {
            return Err(invalid("base_urls", format!("'{}' is not an http(s) URL", bad)));
        }
        self.tz()?;
        if self.window_minutes == 0 {
            return Err(invalid("window_minutes", "must be greater than zero"));
        }
        if self.http.page_size == 0 {
            return Err(invalid("http.page_size", "must be greater than zero"));
        }
        if self.http.timeout_secs == 0 {
            return Err(invalid("http.timeout_secs", "must be greater than zero"));
        }
        for name in &self.placeholder_metrics {
            name.parse::<Metric>().map_err(|e| invalid("placeholder_metrics", e))?;
        }
        Ok(())
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| invalid("timezone", format!("unknown time zone '{}'", self.timezone)))
    }

    pub fn placeholder_metrics(&self) -> Vec<Metric> {
        self.placeholder_metrics
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect()
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            timeout: Duration::from_secs(self.http.timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.http.max_attempts,
                initial_delay: Duration::from_millis(self.http.initial_backoff_ms),
                max_delay: Duration::from_secs(self.http.max_backoff_secs),
            },
        }
    }

    /// One [`StaSource`] per base URL, sharing a connection pool.
    pub fn source_chain(&self) -> Result<SourceChain<StaSource>, SourceError> {
        let http = HttpClient::new(&self.http_settings())?;
        let sources = self
            .base_urls
            .iter()
            .filter(|b| !b.trim().is_empty())
            .map(|base| StaSource::new(base.trim(), http.clone(), self.http.page_size))
            .collect();
        Ok(SourceChain::new(sources))
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            api_filter: self.api_filter.enabled,
            category_whitelist: self.category_whitelist.clone(),
            authorities: self.api_filter.authorities.clone(),
        }
    }

    pub fn export_filter(&self) -> ExportFilter {
        ExportFilter {
            allow_authorities: self.allow_authorities.clone(),
            category_whitelist: self.category_whitelist.clone(),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ObservationSource;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.base_urls.len(), 2);
        assert_eq!(config.window_minutes, 20);
        assert!(config.fill_missing_grid);
        assert_eq!(config.placeholder_metrics(), Metric::ALL.to_vec());
        assert_eq!(config.tz().unwrap(), chrono_tz::Asia::Taipei);
    }

    #[test]
    fn test_partial_toml_keeps_defaults_for_missing_fields() {
        let config: Config = toml::from_str(
            r#"
            base_urls = ["https://sta.example.org/v1.0"]
            window_minutes = 30

            [http]
            max_attempts = 2

            [api_filter]
            enabled = true
            authorities = ["水利署"]
            "#,
        )
        .unwrap();

        assert_eq!(config.base_urls, vec!["https://sta.example.org/v1.0"]);
        assert_eq!(config.window_minutes, 30);
        assert_eq!(config.http.max_attempts, 2);
        assert_eq!(config.http.page_size, 1000);
        assert_eq!(config.timezone, "Asia/Taipei");
        assert!(config.sync_options().api_filter);
        assert_eq!(config.sync_options().authorities, vec!["水利署"]);
    }

    #[test]
    fn test_load_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("absent.toml");
        assert!(matches!(Config::load(Some(&explicit)), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "window_minutes = \"twenty\"").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[
                ("STA_BASE_URLS", "https://a.example/v1.0, https://b.example/v1.0,"),
                ("STA_TIMEZONE", "UTC"),
                ("STA_WINDOW_MINUTES", "45"),
                ("STA_FILL_MISSING_GRID", "false"),
                ("STA_DB_PATH", "  "),
            ]))
            .unwrap();

        assert_eq!(config.base_urls, vec!["https://a.example/v1.0", "https://b.example/v1.0"]);
        assert_eq!(config.timezone, "UTC");
        assert_eq!(config.window_minutes, 45);
        assert!(!config.fill_missing_grid);
        assert_eq!(config.db_path, PathBuf::from("hydro.db"), "blank override is ignored");
    }

    #[test]
    fn test_bad_env_override_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(env(&[("STA_WINDOW_MINUTES", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("STA_WINDOW_MINUTES"));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.timezone = "Mars/Olympus".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.base_urls.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.base_urls = vec!["ftp://nope".into()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.window_minutes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.placeholder_metrics = vec!["water_level".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_settings_mapping() {
        let settings = Config::default().http_settings();
        assert_eq!(settings.timeout, Duration::from_secs(20));
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.initial_delay, Duration::from_millis(500));
        assert_eq!(settings.retry.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_source_chain_follows_base_order() {
        let chain = Config::default().source_chain().unwrap();
        let bases: Vec<&str> = chain.sources().iter().map(|s| s.base_url()).collect();
        assert_eq!(
            bases,
            vec![
                "https://sta.colife.org.tw/STA_Rain/v1.0",
                "https://sta.colife.org.tw/STA_WaterResource_v2/v1.0",
            ]
        );
    }
}
