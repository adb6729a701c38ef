use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Pre-compiled regex for hostname validation (compiled once at first use)
static HOSTNAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][-a-zA-Z0-9\.]*[a-zA-Z0-9]$").unwrap());

/// Broker URL selecting the in-process broker.
pub const MEMORY_BROKER_URL: &str = "memory://";

#[derive(Debug, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub logging: Option<LoggingSection>,
    #[serde(default)]
    pub database: Option<DatabaseSection>,
    #[serde(default)]
    pub broker: Option<BrokerSection>,
    #[serde(default)]
    pub search: Option<SearchSection>,
    #[serde(default)]
    pub clock: Option<ClockSection>,
    #[serde(default)]
    pub workers: Option<WorkersSection>,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct BrokerSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub visibility_timeout_secs: Option<u64>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchSection {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub results_per_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ClockSection {
    #[serde(default)]
    pub time_source_url: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct WorkersSection {
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub autostart: Option<bool>,
    #[serde(default)]
    pub persistence_retry_delay_ms: Option<u64>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Load a RawConfigFile from a path. The format is inferred from the extension: .toml, .yaml/.yml, .json
pub fn load_raw_from_file<P: AsRef<Path>>(path: P) -> Result<RawConfigFile, ConfigError> {
    let path = path.as_ref();
    let s = fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase());
    parse_config_str(&s, ext.as_deref())
}

/// Parse configuration from a string with optional format hint
#[inline]
fn parse_config_str(s: &str, ext: Option<&str>) -> Result<RawConfigFile, ConfigError> {
    match ext {
        #[cfg(feature = "toml")]
        Some("toml") => toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string())),
        #[cfg(feature = "yaml")]
        Some("yaml" | "yml") => {
            serde_yaml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
        }
        #[cfg(feature = "json")]
        Some("json") => serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string())),
        _ => parse_config_auto(s),
    }
}

/// Try to parse config by attempting each enabled format
#[inline]
fn parse_config_auto(s: &str) -> Result<RawConfigFile, ConfigError> {
    #[cfg(feature = "json")]
    if let Ok(cfg) = serde_json::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(feature = "toml")]
    if let Ok(cfg) = toml::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(feature = "yaml")]
    if let Ok(cfg) = serde_yaml::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(any(feature = "yaml", feature = "toml", feature = "json"))]
    {
        Err(ConfigError::Parse(
            "failed to parse config as any supported format".into(),
        ))
    }

    #[cfg(not(any(feature = "yaml", feature = "toml", feature = "json")))]
    {
        let _ = s;
        Err(ConfigError::Parse("no config format enabled".into()))
    }
}

/// Concrete application configuration with defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub search: SearchConfig,
    pub clock: ClockConfig,
    pub workers: WorkersConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerConfig {
    /// `memory://` or a sqlite URL holding the durable queue.
    pub url: String,
    pub queue: String,
    /// Total connection attempts before giving up.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub visibility_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub results_per_page: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClockConfig {
    /// Without a URL timestamps come from the local clock.
    pub time_source_url: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkersConfig {
    pub count: usize,
    pub autostart: bool,
    pub persistence_retry_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
            database: DatabaseConfig {
                url: "sqlite://vigil.sqlite".to_string(),
                max_connections: 10,
                min_connections: 1,
                connect_timeout_secs: 30,
            },
            broker: BrokerConfig {
                url: "sqlite://vigil.sqlite".to_string(),
                queue: "vulnerability_analysis".to_string(),
                max_retries: 5,
                retry_delay_ms: 2000,
                visibility_timeout_secs: 300,
                poll_interval_ms: 500,
            },
            search: SearchConfig {
                base_url: "https://services.nvd.nist.gov/rest/json/cves/2.0".to_string(),
                api_key: None,
                timeout_secs: 30,
                results_per_page: 20,
            },
            clock: ClockConfig {
                time_source_url: None,
                timeout_ms: 1500,
            },
            workers: WorkersConfig {
                count: 1,
                autostart: true,
                persistence_retry_delay_ms: 1000,
            },
        }
    }
}

impl BrokerConfig {
    pub fn is_memory(&self) -> bool {
        self.url.trim() == MEMORY_BROKER_URL
    }

    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub const fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SearchConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ClockConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl WorkersConfig {
    pub const fn persistence_retry_delay(&self) -> Duration {
        Duration::from_millis(self.persistence_retry_delay_ms)
    }
}

#[inline]
fn parse_bool(s: &str) -> Result<bool, ()> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        _ => Err(()),
    }
}

/// Helper macro to apply optional value if present
macro_rules! apply_opt {
    ($target:expr, $source:expr) => {
        if let Some(v) = $source {
            $target = v;
        }
    };
    ($target:expr, $source:expr, wrap) => {
        if let Some(v) = $source {
            $target = Some(v);
        }
    };
}

/// Load concrete `Config` from optional file and environment variables.
/// Environment variables take precedence over file values and defaults.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<Config, ConfigError> {
    load_config_with(path, |key| env::var(key).ok())
}

/// Like [`load_config`] but reads overrides through `lookup` instead of the
/// process environment.
pub fn load_config_with<P, F>(path: Option<P>, lookup: F) -> Result<Config, ConfigError>
where
    P: AsRef<Path>,
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = Config::default();

    if let Some(p) = path {
        apply_file(&mut cfg, load_raw_from_file(p)?);
    }
    apply_overrides(&mut cfg, &lookup)?;
    validate_config(&cfg)?;

    Ok(cfg)
}

fn apply_file(cfg: &mut Config, raw: RawConfigFile) {
    if let Some(server) = raw.server {
        apply_opt!(cfg.server.host, server.host);
        apply_opt!(cfg.server.port, server.port);
    }
    if let Some(logging) = raw.logging {
        apply_opt!(cfg.logging.level, logging.level);
        apply_opt!(cfg.logging.json, logging.json);
    }
    if let Some(db) = raw.database {
        apply_opt!(cfg.database.url, db.url);
        apply_opt!(cfg.database.max_connections, db.max_connections);
        apply_opt!(cfg.database.min_connections, db.min_connections);
        apply_opt!(cfg.database.connect_timeout_secs, db.connect_timeout_secs);
    }
    if let Some(broker) = raw.broker {
        apply_opt!(cfg.broker.url, broker.url);
        apply_opt!(cfg.broker.queue, broker.queue);
        apply_opt!(cfg.broker.max_retries, broker.max_retries);
        apply_opt!(cfg.broker.retry_delay_ms, broker.retry_delay_ms);
        apply_opt!(cfg.broker.visibility_timeout_secs, broker.visibility_timeout_secs);
        apply_opt!(cfg.broker.poll_interval_ms, broker.poll_interval_ms);
    }
    if let Some(search) = raw.search {
        apply_opt!(cfg.search.base_url, search.base_url);
        apply_opt!(cfg.search.api_key, search.api_key, wrap);
        apply_opt!(cfg.search.timeout_secs, search.timeout_secs);
        apply_opt!(cfg.search.results_per_page, search.results_per_page);
    }
    if let Some(clock) = raw.clock {
        apply_opt!(cfg.clock.time_source_url, clock.time_source_url, wrap);
        apply_opt!(cfg.clock.timeout_ms, clock.timeout_ms);
    }
    if let Some(workers) = raw.workers {
        apply_opt!(cfg.workers.count, workers.count);
        apply_opt!(cfg.workers.autostart, workers.autostart);
        apply_opt!(
            cfg.workers.persistence_retry_delay_ms,
            workers.persistence_retry_delay_ms
        );
    }
}

/// Reads overrides from a key lookup; empty values count as unset.
struct Overrides<'a, F> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Overrides<'_, F> {
    fn str(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.str(key) {
            Some(v) => v
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::Parse(format!("invalid {key}: {e}"))),
            None => Ok(None),
        }
    }

    fn bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.str(key) {
            Some(v) => parse_bool(&v)
                .map(Some)
                .map_err(|_| ConfigError::Parse(format!("invalid {key}"))),
            None => Ok(None),
        }
    }
}

/// Apply all environment variable overrides to config
fn apply_overrides<F: Fn(&str) -> Option<String>>(
    cfg: &mut Config,
    lookup: &F,
) -> Result<(), ConfigError> {
    let env = Overrides { lookup };

    // Server
    apply_opt!(cfg.server.host, env.str("VIGIL_SERVER_HOST"));
    apply_opt!(cfg.server.port, env.parse::<u16>("VIGIL_SERVER_PORT")?);

    // Logging
    apply_opt!(cfg.logging.level, env.str("VIGIL_LOG_LEVEL"));
    apply_opt!(cfg.logging.json, env.bool("VIGIL_LOG_JSON")?);

    // Database
    apply_opt!(cfg.database.url, env.str("VIGIL_DATABASE_URL"));
    apply_opt!(
        cfg.database.max_connections,
        env.parse::<u32>("VIGIL_DB_MAX_CONNECTIONS")?
    );

    // Broker
    apply_opt!(cfg.broker.url, env.str("VIGIL_BROKER_URL"));
    apply_opt!(cfg.broker.queue, env.str("VIGIL_QUEUE_NAME"));
    apply_opt!(
        cfg.broker.max_retries,
        env.parse::<u32>("VIGIL_BROKER_MAX_RETRIES")?
    );
    apply_opt!(
        cfg.broker.retry_delay_ms,
        env.parse::<u64>("VIGIL_BROKER_RETRY_DELAY_MS")?
    );
    apply_opt!(
        cfg.broker.visibility_timeout_secs,
        env.parse::<u64>("VIGIL_BROKER_VISIBILITY_TIMEOUT_SECS")?
    );
    apply_opt!(
        cfg.broker.poll_interval_ms,
        env.parse::<u64>("VIGIL_BROKER_POLL_INTERVAL_MS")?
    );

    // Search
    apply_opt!(cfg.search.base_url, env.str("VIGIL_SEARCH_BASE_URL"));
    apply_opt!(cfg.search.api_key, env.str("VIGIL_SEARCH_API_KEY"), wrap);
    apply_opt!(
        cfg.search.timeout_secs,
        env.parse::<u64>("VIGIL_SEARCH_TIMEOUT_SECS")?
    );

    // Clock
    apply_opt!(
        cfg.clock.time_source_url,
        env.str("VIGIL_TIME_SOURCE_URL"),
        wrap
    );
    apply_opt!(cfg.clock.timeout_ms, env.parse::<u64>("VIGIL_CLOCK_TIMEOUT_MS")?);

    // Workers
    apply_opt!(cfg.workers.count, env.parse::<usize>("VIGIL_WORKER_COUNT")?);
    apply_opt!(cfg.workers.autostart, env.bool("VIGIL_WORKER_AUTOSTART")?);

    Ok(())
}

fn validate_http_url(field: &str, raw: &str) -> Result<(), ConfigError> {
    match url::Url::parse(raw) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => Ok(()),
        Ok(_) => Err(ConfigError::Validation(format!(
            "{field} must be http or https: {raw}"
        ))),
        Err(e) => Err(ConfigError::Validation(format!("invalid {field}: {raw}: {e}"))),
    }
}

fn validate_sqlite_url(field: &str, raw: &str) -> Result<(), ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConfigError::Validation(format!("{field} must be set")));
    }
    if !raw.starts_with("sqlite:") {
        return Err(ConfigError::Validation(format!(
            "{field} must be a sqlite url: {raw}"
        )));
    }
    Ok(())
}

/// Headroom a broker lease keeps beyond the slowest possible job.
const LEASE_MARGIN_MS: u64 = 5_000;

/// Validate higher-level constraints on the resolved configuration.
pub fn validate_config(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.server.port == 0 {
        return Err(ConfigError::Validation("server.port must be > 0".into()));
    }
    let host_ok = cfg.server.host.parse::<std::net::IpAddr>().is_ok()
        || HOSTNAME_REGEX.is_match(&cfg.server.host);
    if !host_ok {
        return Err(ConfigError::Validation(format!(
            "invalid server.host: {}",
            cfg.server.host
        )));
    }

    validate_sqlite_url("database.url", &cfg.database.url)?;
    if cfg.database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be > 0".into(),
        ));
    }
    if cfg.database.min_connections > cfg.database.max_connections {
        return Err(ConfigError::Validation(
            "database.min_connections must not exceed database.max_connections".into(),
        ));
    }

    if !cfg.broker.is_memory() {
        validate_sqlite_url("broker.url", &cfg.broker.url)?;
    }
    if cfg.broker.queue.trim().is_empty() {
        return Err(ConfigError::Validation("broker.queue must not be empty".into()));
    }

    validate_http_url("search.base_url", &cfg.search.base_url)?;
    if cfg.search.timeout_secs == 0 {
        return Err(ConfigError::Validation("search.timeout_secs must be > 0".into()));
    }
    if cfg.search.results_per_page == 0 {
        return Err(ConfigError::Validation(
            "search.results_per_page must be > 0".into(),
        ));
    }

    if let Some(url) = &cfg.clock.time_source_url {
        validate_http_url("clock.time_source_url", url)?;
    }

    // A lease must outlast one job: the search plus the start and finish
    // clock reads, with headroom for the store writes.
    if !cfg.broker.is_memory() {
        let job_ms = cfg
            .search
            .timeout_secs
            .saturating_mul(1000)
            .saturating_add(cfg.clock.timeout_ms.saturating_mul(2))
            .saturating_add(LEASE_MARGIN_MS);
        if cfg.broker.visibility_timeout_secs.saturating_mul(1000) <= job_ms {
            return Err(ConfigError::Validation(format!(
                "broker.visibility_timeout_secs must exceed {}s (search timeout, clock timeouts and margin)",
                job_ms.div_ceil(1000)
            )));
        }
    }

    if cfg.workers.count == 0 {
        return Err(ConfigError::Validation("workers.count must be >= 1".into()));
    }
    Ok(())
}
