//! Typed configuration, built once at startup and shared read-only.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `RELAY__SMTP__LISTEN_ADDR`
pub const ENV_PREFIX: &str = "RELAY";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpConfig,
    pub queue: QueueConfig,
    pub delivery: DeliveryConfig,
    pub directory: DirectoryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name announced in the greeting; should match the reverse DNS
    pub hostname: String,
    pub product: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub listen_addr: String,
    pub max_sessions: usize,
    pub idle_timeout_secs: u64,
    pub max_message_size: usize,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub database_url: String,
    pub workers: usize,
    pub handoff_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub local_domains: Vec<String>,
    pub poll_interval_secs: u64,
    /// Port used when relaying to a remote exchange
    pub relay_port: u16,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "server.example.com".to_string(),
            product: "relay-rs".to_string(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2525".to_string(),
            max_sessions: 50,
            idle_timeout_secs: 10,
            max_message_size: 128 * 1024,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://relay-queue.db?mode=rwc".to_string(),
            workers: 3,
            handoff_capacity: 5,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            local_domains: vec!["example.com".to_string()],
            poll_interval_secs: 3,
            relay_port: 25,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl SmtpConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl DeliveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Lowercased set of the domains this server delivers for
    pub fn local_domain_set(&self) -> HashSet<String> {
        self.local_domains
            .iter()
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect()
    }
}

impl Config {
    /// Load a TOML file as-is
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(e.to_string()))?;

        toml::from_str(&content).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Layer an optional TOML file and `RELAY__*` environment variables over the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            let name = path.to_string_lossy();
            builder = builder.add_source(
                config::File::new(&name, config::FileFormat::Toml).required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("delivery.local_domains")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RelayError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.smtp.max_sessions == 0 {
            return Err(RelayError::Config("smtp.max_sessions must be at least 1".to_string()));
        }
        if self.queue.workers == 0 || self.queue.handoff_capacity == 0 {
            return Err(RelayError::Config(
                "queue.workers and queue.handoff_capacity must be at least 1".to_string(),
            ));
        }
        if self.smtp.tls_cert_path.is_some() != self.smtp.tls_key_path.is_some() {
            return Err(RelayError::Config(
                "smtp.tls_cert_path and smtp.tls_key_path must be set together".to_string(),
            ));
        }
        if self.delivery.poll_interval_secs == 0 {
            return Err(RelayError::Config(
                "delivery.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
