//! Logging Module
//!
//! Application logging through `tracing`: compact console output plus, when a log
//! directory is configured, a daily rolling file under `<log_dir>/<hostname>/`.

use crate::{ProxyError, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "mcc-proxy.log";

/// Resolved logging settings
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub hostname: String,
}

/// Logger manager
pub struct LoggerManager {
    settings: LoggingSettings,
}

impl LoggerManager {
    pub fn new(settings: LoggingSettings) -> Self {
        Self { settings }
    }

    pub fn from_config(config: &crate::config::LoggingConfig, hostname: String) -> Self {
        Self::new(LoggingSettings {
            log_level: config.log_level.clone(),
            log_dir: config.log_dir.clone(),
            hostname,
        })
    }

    /// Directory the rolling log file goes to, if file logging is enabled
    pub fn host_log_dir(&self) -> Option<PathBuf> {
        self.settings
            .log_dir
            .as_ref()
            .map(|dir| dir.join(&self.settings.hostname))
    }

    /// Install the global subscriber
    pub fn initialize(&self) -> Result<()> {
        let host_log_dir = self.host_log_dir();

        let file_layer = match &host_log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    ProxyError::IoError(format!("Failed to create app log directory: {}", e))
                })?;
                let file_appender =
                    RollingFileAppender::new(Rotation::DAILY, dir.clone(), LOG_FILE_PREFIX);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                        .compact(),
                )
            }
            None => None,
        };

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        // RUST_LOG wins over the configured level
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.settings.log_level));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(_) => {
                info!(
                    "Application logging initialized for host: {}",
                    self.settings.hostname
                );
                if let Some(dir) = host_log_dir {
                    info!("Application logs will be written to: {:?}", dir);
                }
            }
            Err(_) => {
                // Already initialized, e.g. by a test harness
                debug!("Tracing subscriber already initialized, skipping");
            }
        }
        Ok(())
    }

    /// Remove rolled log files older than `keep_days`; returns how many were removed
    pub fn rotate_logs(&self, keep_days: u32) -> Result<usize> {
        let Some(dir) = self.host_log_dir() else {
            return Ok(0);
        };
        let removed = cleanup_old_logs(&dir, Duration::from_secs(keep_days as u64 * 24 * 3600))?;
        info!("Log cleanup removed {} files from {:?}", removed, dir);
        Ok(removed)
    }
}

fn cleanup_old_logs(log_dir: &Path, max_age: Duration) -> Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let is_log = entry
            .file_name()
            .to_string_lossy()
            .starts_with(LOG_FILE_PREFIX);
        let modified = entry.metadata().and_then(|m| m.modified());
        match modified {
            Ok(modified) if is_log && modified < cutoff => {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!("Failed to remove old log file {:?}: {}", entry.path(), e);
                } else {
                    debug!("Removed old log file: {:?}", entry.path());
                    removed += 1;
                }
            }
            _ => {}
        }
    }
    Ok(removed)
}
