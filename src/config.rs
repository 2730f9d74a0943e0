//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! Precedence, lowest first: built-in defaults, YAML file, `MCC_PROXY_*` environment
//! variables, command-line flags.

use crate::access_tracker::AccessTrackerKind;
use crate::{ProxyError, Result};
use clap::{Arg, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();
        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let seconds = match unit {
            "ms" | "millis" | "millisecond" | "milliseconds" => value / 1000.0,
            "" | "s" | "sec" | "secs" | "second" | "seconds" => value,
            "m" | "min" | "mins" | "minute" | "minutes" => value * 60.0,
            "h" | "hr" | "hrs" | "hour" | "hours" => value * 3600.0,
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };
        Ok(Duration::from_secs_f64(seconds))
    }
}

/// How the proxy reacts when it detects a version race between cached and fetched items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VersionSelectionPolicy {
    /// Re-read the whole batch from the database as soon as a race is detected
    #[default]
    Eager,
}

impl FromStr for VersionSelectionPolicy {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EAGER" => Ok(VersionSelectionPolicy::Eager),
            other => Err(ProxyError::ConfigError(format!(
                "Unsupported version selection policy: {}",
                other
            ))),
        }
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Upper bound on handling one API request
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8980,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerType {
    #[default]
    Fixed,
    Variable,
}

/// Access history kept per cached item
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessTrackerConfig {
    #[serde(rename = "type")]
    pub tracker_type: TrackerType,
    /// Window in time steps; only used by the variable tracker
    pub window_size: usize,
}

impl Default for AccessTrackerConfig {
    fn default() -> Self {
        Self {
            tracker_type: TrackerType::Fixed,
            window_size: 256,
        }
    }
}

impl AccessTrackerConfig {
    pub fn kind(&self) -> AccessTrackerKind {
        match self.tracker_type {
            TrackerType::Fixed => AccessTrackerKind::Fixed,
            TrackerType::Variable => AccessTrackerKind::Variable {
                window_size: self.window_size,
            },
        }
    }
}

/// Consistency cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte budget of the cache store
    pub cache_size: u64,
    /// Database table the proxy reads from
    pub table: String,
    pub access_tracker: AccessTrackerConfig,
    /// Fail reads that would return an older version of a key than a previous read
    pub verify_monotonic_reads: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size: 1000,
            table: "test".to_string(),
            access_tracker: AccessTrackerConfig::default(),
            verify_monotonic_reads: false,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.cache_size == 0 {
            return Err("cache_size must be greater than 0".to_string());
        }
        if self.table.is_empty() {
            return Err("table must not be empty".to_string());
        }
        if self.access_tracker.tracker_type == TrackerType::Variable
            && (self.access_tracker.window_size == 0 || self.access_tracker.window_size % 64 != 0)
        {
            return Err(format!(
                "access_tracker.window_size must be a positive multiple of 64, got {}",
                self.access_tracker.window_size
            ));
        }
        Ok(())
    }
}

/// Database connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost:5432/postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
        }
    }
}

/// Cache store connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStoreConfig {
    pub host: String,
    pub port: u16,
}

impl Default for CacheStoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictorKind {
    /// Nothing is predicted obsolete
    #[default]
    None,
    /// Items without recent reads are obsolete
    Idle,
    /// Ask a prediction service over HTTP
    Remote,
}

/// Obsolescence predictor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub kind: PredictorKind,
    /// `host:port` of the prediction service
    pub address: Option<String>,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub request_timeout: Duration,
    /// Time steps without a read after which the idle predictor flags an item
    pub idle_window: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            kind: PredictorKind::None,
            address: None,
            request_timeout: Duration::from_secs(2),
            idle_window: 200,
        }
    }
}

impl PredictorConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.kind == PredictorKind::Remote
            && self.address.as_deref().map(str::is_empty).unwrap_or(true)
        {
            return Err("remote predictor requires predictor.address".to_string());
        }
        if self.kind == PredictorKind::Idle && self.idle_window == 0 {
            return Err("predictor.idle_window must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Application logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Directory for daily rolling log files; console only when unset
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub version_selection_policy: VersionSelectionPolicy,
    pub database: DatabaseConfig,
    pub cache_store: CacheStoreConfig,
    pub predictor: PredictorConfig,
    pub logging: LoggingConfig,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
            version_selection_policy: VersionSelectionPolicy::Eager,
            database: DatabaseConfig::default(),
            cache_store: CacheStoreConfig::default(),
            predictor: PredictorConfig::default(),
            logging: LoggingConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from the process arguments and environment
    pub fn load() -> Result<Self> {
        Self::load_from_args(std::env::args_os())
    }

    /// Load configuration from explicit arguments (the first one is the program name)
    pub fn load_from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::build_cli()
            .try_get_matches_from(args)
            .map_err(|e| ProxyError::ConfigError(e.to_string()))?;

        let mut config = Self::default();

        // Load from config file if specified
        if let Some(config_path) = matches.get_one::<String>("config") {
            config = Self::load_from_file(config_path)?;
        }

        // Override with environment variables
        config.apply_env_overrides()?;

        // Override with command line arguments
        config.apply_cli_overrides(&matches)?;

        config.validate()?;
        Ok(config)
    }

    fn build_cli() -> Command {
        Command::new("mcc-proxy")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Cache proxy serving multi-key reads with Monotonic Cache Consistency")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .help("API server port (default: 8980)"),
            )
            .arg(
                Arg::new("bind-address")
                    .long("bind-address")
                    .value_name("ADDR")
                    .help("API server bind address"),
            )
            .arg(
                Arg::new("cache-size")
                    .long("cache-size")
                    .value_name("BYTES")
                    .help("Cache budget in bytes"),
            )
            .arg(
                Arg::new("version-selection-policy")
                    .long("version-selection-policy")
                    .value_name("POLICY")
                    .help("Version selection policy (EAGER)"),
            )
            .arg(
                Arg::new("predictor-address")
                    .long("predictor-address")
                    .value_name("HOST:PORT")
                    .help("Prediction service address; selects the remote predictor"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("verify-monotonic-reads")
                    .long("verify-monotonic-reads")
                    .action(clap::ArgAction::SetTrue)
                    .help("Fail reads that return an older version than a previous read"),
            )
    }

    fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply `MCC_PROXY_*` overrides looked up through `lookup`
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("MCC_PROXY_PORT") {
            self.server.port = parse_value("MCC_PROXY_PORT", &port)?;
        }
        if let Some(addr) = lookup("MCC_PROXY_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }
        if let Some(size) = lookup("MCC_PROXY_CACHE_SIZE") {
            self.cache.cache_size = parse_value("MCC_PROXY_CACHE_SIZE", &size)?;
        }
        if let Some(policy) = lookup("MCC_PROXY_VERSION_SELECTION_POLICY") {
            self.version_selection_policy = policy.parse()?;
        }
        if let Some(url) = lookup("MCC_PROXY_DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(user) = lookup("MCC_PROXY_DATABASE_USER") {
            self.database.user = user;
        }
        if let Some(password) = lookup("MCC_PROXY_DATABASE_PASSWORD") {
            self.database.password = password;
        }
        if let Some(host) = lookup("MCC_PROXY_CACHE_STORE_HOST") {
            self.cache_store.host = host;
        }
        if let Some(port) = lookup("MCC_PROXY_CACHE_STORE_PORT") {
            self.cache_store.port = parse_value("MCC_PROXY_CACHE_STORE_PORT", &port)?;
        }
        if let Some(address) = lookup("MCC_PROXY_PREDICTOR_ADDRESS") {
            self.predictor.kind = PredictorKind::Remote;
            self.predictor.address = Some(address);
        }
        if let Some(level) = lookup("MCC_PROXY_LOG_LEVEL") {
            self.logging.log_level = level;
        }
        Ok(())
    }

    fn apply_cli_overrides(&mut self, matches: &ArgMatches) -> Result<()> {
        if let Some(port) = matches.get_one::<String>("port") {
            self.server.port = parse_value("--port", port)?;
        }
        if let Some(addr) = matches.get_one::<String>("bind-address") {
            self.server.bind_address = addr.clone();
        }
        if let Some(size) = matches.get_one::<String>("cache-size") {
            self.cache.cache_size = parse_value("--cache-size", size)?;
        }
        if let Some(policy) = matches.get_one::<String>("version-selection-policy") {
            self.version_selection_policy = policy.parse()?;
        }
        if let Some(address) = matches.get_one::<String>("predictor-address") {
            self.predictor.kind = PredictorKind::Remote;
            self.predictor.address = Some(address.clone());
        }
        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }
        if matches.get_flag("verify-monotonic-reads") {
            self.cache.verify_monotonic_reads = true;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Err(e) = self.cache.validate() {
            return Err(ProxyError::ConfigError(format!(
                "Invalid cache configuration: {}",
                e
            )));
        }
        if let Err(e) = self.predictor.validate() {
            return Err(ProxyError::ConfigError(format!(
                "Invalid predictor configuration: {}",
                e
            )));
        }
        if self.server.port == 0 {
            return Err(ProxyError::ConfigError(
                "Invalid server configuration: port must not be 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ProxyError::ConfigError(format!("Invalid value for {}: {} ({})", name, value, e)))
}
