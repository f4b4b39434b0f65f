//! Station configuration.
//!
//! Everything has a default; a missing config file is not an error. Paths are
//! resolved relative to the operator's home directory unless set explicitly.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const CONFIG_ENV: &str = "TOOLCRIB_CONFIG";
pub const SOCKET_ENV: &str = "TOOLCRIB_SOCKET";
pub const DEBUG_LOG_ENV: &str = "TOOLCRIB_DEBUG_LOG";

const DATA_DIR_NAME: &str = ".toolcrib";
const SOCKET_NAME: &str = "daemon.sock";
const DB_NAME: &str = "toolcrib.db";
const CONFIG_NAME: &str = "config.toml";
const FEED_NAME: &str = "reader.feed";

/// Upper bound for every seconds-valued scan setting.
const MAX_SCAN_SECS: f64 = 3600.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default = "default_station_id")]
    pub station_id: String,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            station_id: default_station_id(),
            scan: ScanConfig::default(),
            reader: ReaderConfig::default(),
            notify: NotifyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_station_id() -> String {
    "station-1".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    pub debounce_secs: f64,
    pub poll_timeout_secs: f64,
    pub reset_delay_secs: f64,
    pub idle_sleep_ms: u64,
    pub inactive_sleep_ms: u64,
    pub fault_backoff_ms: u64,
    pub fault_backoff_max_ms: u64,
    pub manual_scan_timeout_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            debounce_secs: 2.0,
            poll_timeout_secs: 1.0,
            reset_delay_secs: 3.0,
            idle_sleep_ms: 100,
            inactive_sleep_ms: 500,
            fault_backoff_ms: 1_000,
            fault_backoff_max_ms: 10_000,
            manual_scan_timeout_secs: 5,
        }
    }
}

impl ScanConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs_f64(self.debounce_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.poll_timeout_secs)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_secs_f64(self.reset_delay_secs)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn inactive_sleep(&self) -> Duration {
        Duration::from_millis(self.inactive_sleep_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let seconds = [
            ("scan.debounce_secs", self.debounce_secs),
            ("scan.poll_timeout_secs", self.poll_timeout_secs),
            ("scan.reset_delay_secs", self.reset_delay_secs),
        ];
        for (field, value) in seconds {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a non-negative number",
                    field
                )));
            }
            if value > MAX_SCAN_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{} must be at most {} seconds",
                    field, MAX_SCAN_SECS
                )));
            }
        }
        if self.poll_timeout_secs <= 0.0 {
            return Err(ConfigError::Invalid(
                "scan.poll_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.fault_backoff_max_ms < self.fault_backoff_ms {
            return Err(ConfigError::Invalid(
                "scan.fault_backoff_max_ms must be >= scan.fault_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReaderKind {
    #[default]
    Lines,
    Pcsc,
}

impl ReaderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReaderKind::Lines => "lines",
            ReaderKind::Pcsc => "pcsc",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaderConfig {
    pub kind: ReaderKind,
    /// Feed file for the `lines` reader.
    pub path: Option<PathBuf>,
    /// Substring of the PC/SC reader name to use.
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    pub capacity: usize,
    pub history: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            history: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub debug: bool,
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug: false,
            file: true,
        }
    }
}

/// Filesystem locations the daemon uses.
#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub socket: PathBuf,
    pub db: PathBuf,
    pub logs: PathBuf,
    pub feed: PathBuf,
}

impl Paths {
    pub fn resolve(config: &DaemonConfig) -> Result<Self, ConfigError> {
        let data_dir = data_dir()?;
        let socket = match env::var(SOCKET_ENV) {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => data_dir.join(SOCKET_NAME),
        };
        let daemon_dir = data_dir.join("daemon");
        let feed = config
            .reader
            .path
            .clone()
            .unwrap_or_else(|| data_dir.join(FEED_NAME));

        Ok(Self {
            socket,
            db: daemon_dir.join(DB_NAME),
            logs: daemon_dir.join("logs"),
            feed,
            data_dir,
        })
    }
}

fn data_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
    Ok(home.join(DATA_DIR_NAME))
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(data_dir()?.join("daemon").join(CONFIG_NAME))
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, ConfigError> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    parse_config_file(&config_path)
}

fn parse_config_file(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let content = fs_err::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str::<DaemonConfig>(&content).map_err(|source| {
        ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })?;
    config.scan.validate()?;
    if config.station_id.trim().is_empty() {
        return Err(ConfigError::Invalid("station_id must not be empty".to_string()));
    }
    Ok(config)
}

pub fn debug_logging_forced() -> bool {
    env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}
