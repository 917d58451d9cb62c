//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via DOCWIRE_CONFIG or --config)
//! 3. Environment variables

use crate::bulk::{Acknowledgment, WriteConcern};
use crate::command::TopologyKind;
use crate::connection::{AddressFamily, ConnectionConfig, TlsClientConfig};
use crate::cursor::CursorOptions;
use crate::state::DEFAULT_BATCH_SIZE;
use docwire_protocol::{DecodeOptions, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Socket configuration.
    pub connection: ConnectionSettings,
    /// TLS configuration.
    pub tls: TlsClientConfig,
    /// Cursor defaults.
    pub cursor: CursorSettings,
    /// Default write concern for writes.
    pub write_concern: WriteConcern,
    /// Kind of deployment behind the connection.
    pub topology: TopologyKind,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("DOCWIRE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.connection.apply_env_overrides();
        apply_tls_env_overrides(&mut self.tls);
        self.cursor.apply_env_overrides();

        if let Ok(w) = std::env::var("DOCWIRE_WRITE_W") {
            self.write_concern.w = Some(Acknowledgment::from(w.as_str()));
        }

        if let Ok(topology) = std::env::var("DOCWIRE_TOPOLOGY") {
            if let Ok(parsed) = topology.parse() {
                self.topology = parsed;
            }
        }
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.host.is_empty() {
            return Err(ConfigError::ValidationError(
                "connection host is empty".to_string(),
            ));
        }
        if self.connection.max_message_size <= docwire_protocol::MESSAGE_HEADER_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "max_message_size must exceed the {} byte header",
                docwire_protocol::MESSAGE_HEADER_SIZE
            )));
        }
        validate_tls(&self.tls)
    }

    /// Builds the runtime connection configuration.
    pub fn to_connection_config(&self) -> ConnectionConfig {
        let conn = &self.connection;
        let mut config = ConnectionConfig::new(conn.host.clone(), conn.port)
            .with_family(conn.family)
            .with_keep_alive(conn.keep_alive, conn.keep_alive_initial_delay())
            .with_no_delay(conn.no_delay)
            .with_connect_timeout(conn.connect_timeout())
            .with_socket_timeout(conn.socket_timeout())
            .with_max_message_size(conn.max_message_size)
            .with_read_buffer_size(conn.read_buffer_size)
            .with_promote(conn.promote);
        if self.tls.enabled {
            config = config.with_tls(self.tls.clone());
        }
        config
    }
}

/// Socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Host name, address, or Unix domain socket path.
    pub host: String,
    pub port: u16,
    pub family: AddressFamily,
    pub keep_alive: bool,
    /// Idle time before the first keepalive probe, in milliseconds.
    pub keep_alive_initial_delay_ms: u64,
    pub no_delay: bool,
    /// Dial and handshake timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Inactivity timeout in milliseconds (0 = disabled).
    pub socket_timeout_ms: u64,
    /// Largest framed reply accepted, in bytes.
    pub max_message_size: usize,
    pub read_buffer_size: usize,
    pub promote: DecodeOptions,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            host: defaults.host,
            port: DEFAULT_PORT,
            family: defaults.family,
            keep_alive: defaults.keep_alive,
            keep_alive_initial_delay_ms: defaults.keep_alive_initial_delay.as_millis() as u64,
            no_delay: defaults.no_delay,
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
            socket_timeout_ms: defaults.socket_timeout.as_millis() as u64,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_buffer_size: defaults.read_buffer_size,
            promote: defaults.promote,
        }
    }
}

impl ConnectionSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("DOCWIRE_HOST") {
            if !host.is_empty() {
                self.host = host;
            }
        }

        if let Ok(port) = std::env::var("DOCWIRE_PORT") {
            if let Ok(parsed) = port.parse() {
                self.port = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("DOCWIRE_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.connect_timeout_ms = ms;
            }
        }

        if let Ok(timeout) = std::env::var("DOCWIRE_SOCKET_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.socket_timeout_ms = ms;
            }
        }

        if let Ok(size) = std::env::var("DOCWIRE_MAX_MESSAGE_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_message_size = n;
            }
        }
    }

    pub fn keep_alive_initial_delay(&self) -> Duration {
        Duration::from_millis(self.keep_alive_initial_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }
}

/// Cursor defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorSettings {
    pub batch_size: i32,
    /// Empty tailable batches tolerated before giving up.
    pub number_of_retries: u32,
    /// Pause between empty tailable batches, in milliseconds.
    pub tailable_retry_interval_ms: u64,
}

impl Default for CursorSettings {
    fn default() -> Self {
        let options = CursorOptions::default();
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            number_of_retries: options.number_of_retries,
            tailable_retry_interval_ms: options.tailable_retry_interval.as_millis() as u64,
        }
    }
}

impl CursorSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("DOCWIRE_BATCH_SIZE") {
            if let Ok(n) = size.parse() {
                self.batch_size = n;
            }
        }
    }

    pub fn options(&self) -> CursorOptions {
        CursorOptions {
            number_of_retries: self.number_of_retries,
            tailable_retry_interval: Duration::from_millis(self.tailable_retry_interval_ms),
        }
    }
}

fn env_flag(value: &str) -> bool {
    value == "1" || value.to_lowercase() == "true"
}

fn apply_tls_env_overrides(tls: &mut TlsClientConfig) {
    if let Ok(enabled) = std::env::var("DOCWIRE_TLS_ENABLED") {
        tls.enabled = env_flag(&enabled);
    }

    if let Ok(path) = std::env::var("DOCWIRE_TLS_CA") {
        tls.ca_cert_path = Some(PathBuf::from(path));
    }

    if let Ok(path) = std::env::var("DOCWIRE_TLS_CRL") {
        tls.crl_path = Some(PathBuf::from(path));
    }

    if let Ok(path) = std::env::var("DOCWIRE_TLS_CERT") {
        tls.client_cert_path = Some(PathBuf::from(path));
    }

    if let Ok(path) = std::env::var("DOCWIRE_TLS_KEY") {
        tls.client_key_path = Some(PathBuf::from(path));
    }

    if let Ok(insecure) = std::env::var("DOCWIRE_TLS_INSECURE") {
        if env_flag(&insecure) {
            tls.reject_unauthorized = false;
        }
    }

    if let Ok(name) = std::env::var("DOCWIRE_TLS_SERVER_NAME") {
        tls.server_name = Some(name);
    }
}

/// Validates TLS configuration.
fn validate_tls(tls: &TlsClientConfig) -> Result<(), ConfigError> {
    if !tls.enabled {
        return Ok(());
    }

    if tls.client_cert_path.is_some() != tls.client_key_path.is_some() {
        return Err(ConfigError::ValidationError(
            "TLS client_cert_path and client_key_path must be set together".to_string(),
        ));
    }

    if tls.passphrase.is_some() {
        return Err(ConfigError::ValidationError(
            "encrypted TLS private keys are not supported".to_string(),
        ));
    }

    Ok(())
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
