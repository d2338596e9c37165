//! Server configuration module.
//!
//! # Example
//!
//! ```toml
//! sni = "quic.example"
//!
//! [network]
//! host = "0.0.0.0"
//! port = 6121
//!
//! [logging]
//! level = "info"
//!
//! [session]
//! max_packet_size = 1350
//! idle_timeout_secs = 30
//! ```

pub mod loader;


pub use loader::load_config;

use std::net::{IpAddr, SocketAddr};

use gquic::SessionConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration of the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,

    pub logging: LoggingConfig,

    /// Tuning of the served session
    pub session: SessionConfig,

    /// Only accept a client whose hello names this server.
    ///
    /// **Default:** accept any client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
}

impl ServerConfig {
    /// Validate the entire configuration, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.network.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.session.validate() {
            errors.extend(e.into_iter().map(|err| format!("session: {}", err)));
        }
        if matches!(&self.sni, Some(name) if name.trim().is_empty()) {
            errors.push("sni must not be empty when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// UDP binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host address to bind to.
    ///
    /// **Default:** `"0.0.0.0"`
    pub host: String,

    /// UDP port to bind to.
    ///
    /// **Default:** `6121`
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6121,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.host.parse::<IpAddr>().is_err() {
            errors.push(format!("Invalid host address: {}", self.host));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, String> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| format!("Invalid host address: {}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set.
    ///
    /// **Default:** `Info`
    pub level: LogLevel,
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}
