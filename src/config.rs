// Configuration File Support
//
// This module provides configuration for the fault proxy.
// Supports TOML format with environment variable overrides; the binary then
// applies command-line overrides on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the public listener handles traffic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Raw TCP pass-through, faults applied per connection and per read/write
    #[default]
    Byte,

    /// HTTP/2 (gRPC) pass-through, faults applied per call
    Call,
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyMode::Byte => f.write_str("byte"),
            ProxyMode::Call => f.write_str("call"),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy listener and backend
    pub proxy: ProxySection,

    /// Control-plane server
    pub control: ControlConfig,

    /// Client certificate presented to the backend
    pub tls: TlsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// `[proxy]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxySection {
    /// Address the client under test connects to; `host:` means ephemeral
    pub listen: String,

    /// Backend address to forward to
    pub dial: String,

    /// Byte or call-aware proxying
    pub mode: ProxyMode,

    /// Copy buffer size in bytes (byte mode)
    pub buffer_size: usize,

    /// Timeout for dialing the backend, in milliseconds
    pub dial_timeout_ms: u64,

    /// Standalone process lifetime in seconds; 0 disables the limit
    pub max_lifetime_secs: u64,

    /// How long a quit or signal waits for a graceful drain before going
    /// forceful, in seconds
    pub shutdown_grace_secs: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen: String::new(),
            dial: String::new(),
            mode: ProxyMode::default(),
            buffer_size: 4 * 1024,
            dial_timeout_ms: 10_000,
            max_lifetime_secs: 300,
            shutdown_grace_secs: 5,
        }
    }
}

/// `[control]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    /// Address of the HTTP control server
    pub listen: String,
}

/// `[tls]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM client certificate chain
    pub client_cert: Option<PathBuf>,

    /// PEM private key for `client_cert`
    pub client_key: Option<PathBuf>,
}

impl TlsConfig {
    pub fn is_enabled(&self) -> bool {
        self.client_cert.is_some()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl ProxyConfig {
    /// Configuration for the three addresses every run needs
    pub fn new(listen: impl Into<String>, control: impl Into<String>, dial: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.proxy.listen = listen.into();
        config.control.listen = control.into();
        config.proxy.dial = dial.into();
        config
    }

    /// Same configuration in another mode
    pub fn with_mode(mut self, mode: ProxyMode) -> Self {
        self.proxy.mode = mode;
        self
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration
    /// with environment overrides applied.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default().apply_env_overrides());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: ProxyConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config.apply_env_overrides())
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - FAULT_PROXY_LISTEN
    /// - FAULT_PROXY_CONTROL
    /// - FAULT_PROXY_DIAL
    /// - FAULT_PROXY_MODE
    /// - FAULT_PROXY_LOG_LEVEL
    /// - FAULT_PROXY_LOG_FORMAT
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(listen) = std::env::var("FAULT_PROXY_LISTEN") {
            self.proxy.listen = listen;
        }
        if let Ok(control) = std::env::var("FAULT_PROXY_CONTROL") {
            self.control.listen = control;
        }
        if let Ok(dial) = std::env::var("FAULT_PROXY_DIAL") {
            self.proxy.dial = dial;
        }
        if let Ok(mode) = std::env::var("FAULT_PROXY_MODE") {
            match mode.to_lowercase().as_str() {
                "byte" => self.proxy.mode = ProxyMode::Byte,
                "call" => self.proxy.mode = ProxyMode::Call,
                other => tracing::warn!("Ignoring unknown FAULT_PROXY_MODE {:?}", other),
            }
        }
        if let Ok(level) = std::env::var("FAULT_PROXY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("FAULT_PROXY_LOG_FORMAT") {
            self.logging.format = format;
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.control.listen.is_empty() {
            anyhow::bail!("must specify a control address");
        }
        if self.proxy.listen.is_empty() {
            anyhow::bail!("must specify a listen address");
        }
        if self.proxy.dial.is_empty() {
            anyhow::bail!("must specify a dial address");
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.proxy.buffer_size == 0 {
            anyhow::bail!("Buffer size must be > 0");
        }
        if self.proxy.dial_timeout_ms == 0 {
            anyhow::bail!("Dial timeout must be > 0");
        }

        match (&self.tls.client_cert, &self.tls.client_key) {
            (Some(_), None) => anyhow::bail!("TLS client certificate given without a key"),
            (None, Some(_)) => anyhow::bail!("TLS client key given without a certificate"),
            _ => {}
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.dial_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.proxy.shutdown_grace_secs)
    }

    /// Process lifetime limit, if any
    pub fn max_lifetime(&self) -> Option<Duration> {
        match self.proxy.max_lifetime_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Turn `host:` (empty port) into `host:0` so the OS picks a port
pub fn normalize_listen_addr(addr: &str) -> String {
    if addr.ends_with(':') {
        format!("{}0", addr)
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid() -> ProxyConfig {
        ProxyConfig::new("127.0.0.1:", "127.0.0.1:0", "127.0.0.1:7233")
    }

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.proxy.mode, ProxyMode::Byte);
        assert_eq!(config.proxy.buffer_size, 4096);
        assert_eq!(config.max_lifetime(), Some(Duration::from_secs(300)));
        assert!(!config.tls.is_enabled());
    }

    #[test]
    fn test_validation_requires_addresses() {
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.control.listen.clear();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("control"), "{}", err);

        let mut config = valid();
        config.proxy.listen.clear();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.proxy.dial.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_logging() {
        let mut config = valid();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_tls_pairs() {
        let mut config = valid();
        config.tls.client_cert = Some(PathBuf::from("cert.pem"));
        assert!(config.validate().is_err());

        config.tls.client_key = Some(PathBuf::from("key.pem"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_valid_toml_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[proxy]
listen = "127.0.0.1:7300"
dial = "127.0.0.1:7233"
mode = "call"
buffer_size = 8192

[control]
listen = "127.0.0.1:7301"

[logging]
level = "debug"
"#
        )
        .unwrap();

        let config = ProxyConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.proxy.mode, ProxyMode::Call);
        assert_eq!(config.proxy.buffer_size, 8192);
        assert_eq!(config.control.listen, "127.0.0.1:7301");
        assert_eq!(config.logging.format, "compact");
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[proxy\nlisten = ").unwrap();
        assert!(ProxyConfig::load_from_path(file.path()).is_err());
    }

    #[test]
    fn test_normalize_listen_addr() {
        assert_eq!(normalize_listen_addr("127.0.0.1:"), "127.0.0.1:0");
        assert_eq!(normalize_listen_addr("127.0.0.1:7233"), "127.0.0.1:7233");
        assert_eq!(normalize_listen_addr("localhost:"), "localhost:0");
    }

    #[test]
    fn test_log_level() {
        let mut config = valid();
        config.logging.level = "WARN".to_string();
        assert_eq!(config.log_level().unwrap(), tracing::Level::WARN);
    }
}
