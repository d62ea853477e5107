use config::ConfigError as ConfigLibError;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileReadError(#[from] io::Error),
    #[error("Failed to parse config file: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Config library error: {0}")]
    ConfigLibError(#[from] ConfigLibError),
}

const MAX_STARTUP_TIMEOUT_MS: u64 = 600_000;
const MAX_LOG_FILE_SIZE_MB: u64 = 10_240;

/// Proxy configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProxyConfig {
    /// Address the proxy listens on
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// How long `get_connection` waits for the first handshake (ms)
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Log configuration
    #[serde(default)]
    pub log: LoggerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggerConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path, console only when unset
    #[serde(default)]
    pub path: Option<String>,
    /// Log file archive pattern
    #[serde(default = "default_archive_pattern")]
    pub archive_pattern: String,
    /// Number of log files to keep
    #[serde(default = "default_file_count")]
    pub file_count: u32,
    /// Size of each log file (MB)
    #[serde(default = "default_file_size")]
    pub file_size: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            startup_timeout_ms: default_startup_timeout_ms(),
            log: LoggerConfig::default(),
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: None,
            archive_pattern: default_archive_pattern(),
            file_count: default_file_count(),
            file_size: default_file_size(),
        }
    }
}

/// Loopback, ephemeral port
fn default_listen_address() -> String {
    "127.0.0.1:0".to_string()
}

fn default_startup_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_archive_pattern() -> String {
    "logs/archive/socks5-test-proxy-{}.log".to_string()
}

fn default_file_count() -> u32 {
    5
}

fn default_file_size() -> u64 {
    10
}

impl ProxyConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?;
        Self::from_settings(settings)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?;
        Self::from_settings(settings)
    }

    fn from_settings(settings: config::Config) -> Result<Self, ConfigError> {
        let config: ProxyConfig = settings
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate if configuration is valid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_address.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "Listen address cannot be empty".to_string(),
            ));
        }

        if self.listen_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid listen address format: {}",
                self.listen_address
            )));
        }

        if self.startup_timeout_ms == 0 || self.startup_timeout_ms > MAX_STARTUP_TIMEOUT_MS {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid startup timeout: {}ms. Must be between 1 and {}",
                self.startup_timeout_ms, MAX_STARTUP_TIMEOUT_MS
            )));
        }

        if self.log.path.is_some() && (self.log.file_count == 0 || self.log.file_size == 0) {
            return Err(ConfigError::InvalidConfig(
                "Log file count and size must be non-zero when a log path is set".to_string(),
            ));
        }

        if self.log.file_size > MAX_LOG_FILE_SIZE_MB {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log file size: {}MB. Must be at most {}",
                self.log.file_size, MAX_LOG_FILE_SIZE_MB
            )));
        }

        Ok(())
    }

    pub fn listen_socket_addr(&self) -> io::Result<SocketAddr> {
        self.listen_address.parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: {}", self.listen_address, e),
            )
        })
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}
