//! Client configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tandem_transport::Backoff;

use crate::relayer::{PublisherConfig, RelayerConfig, DEFAULT_RELAY_PROTOCOL};
use crate::sequence::{AppMetadata, EngineConfig, RelayProtocolOptions};
use crate::storage::StorageKey;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Protocol name used in storage keys
    pub protocol: String,
    pub version: u32,
    /// Separates clients sharing one storage backend
    pub context: String,
    pub storage_version: String,
    pub controller: bool,
    pub metadata: Option<AppMetadata>,
    pub relay: RelaySection,
    pub heartbeat_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub publisher: PublisherSection,
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub protocol: String,
    pub auto_reconnect: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSection {
    pub ack_timeout_ms: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: "wc".to_string(),
            version: 2,
            context: "client".to_string(),
            storage_version: "0.3".to_string(),
            controller: false,
            metadata: None,
            relay: RelaySection::default(),
            heartbeat_interval_ms: 5_000,
            request_timeout_ms: 30_000,
            publisher: PublisherSection::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_RELAY_PROTOCOL.to_string(),
            auto_reconnect: true,
        }
    }
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            max_attempts: 5,
            base_backoff_ms: 250,
            max_backoff_ms: 10_000,
        }
    }
}

impl ClientConfig {
    /// Load from a TOML file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Override selected fields from `TANDEM_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(protocol) = std::env::var("TANDEM_RELAY_PROTOCOL") {
            self.relay.protocol = protocol;
        }
        if let Ok(context) = std::env::var("TANDEM_CONTEXT") {
            self.context = context;
        }
        if let Ok(level) = std::env::var("TANDEM_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(controller) = std::env::var("TANDEM_CONTROLLER") {
            self.controller = controller
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid TANDEM_CONTROLLER: {}", e)))?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.is_empty() {
            return Err(ConfigError::Invalid("protocol must not be empty".to_string()));
        }
        if self.context.is_empty() {
            return Err(ConfigError::Invalid("context must not be empty".to_string()));
        }
        if self.relay.protocol.is_empty() {
            return Err(ConfigError::Invalid("relay.protocol must not be empty".to_string()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_ms must be > 0".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be > 0".to_string()));
        }
        if self.publisher.max_attempts == 0 {
            return Err(ConfigError::Invalid("publisher.max_attempts must be > 0".to_string()));
        }
        if self.publisher.base_backoff_ms > self.publisher.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "publisher.base_backoff_ms must not exceed max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn storage_key(&self) -> StorageKey {
        StorageKey::new(
            &self.protocol,
            self.version,
            &self.context,
            &self.storage_version,
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.publisher.max_attempts,
            Duration::from_millis(self.publisher.base_backoff_ms),
            Duration::from_millis(self.publisher.max_backoff_ms),
        )
    }

    pub fn relayer_config(&self) -> RelayerConfig {
        RelayerConfig {
            relay_protocol: self.relay.protocol.clone(),
            publisher: PublisherConfig {
                ack_timeout: Duration::from_millis(self.publisher.ack_timeout_ms),
                backoff: self.backoff(),
            },
            subscribe_backoff: self.backoff(),
            auto_reconnect: self.relay.auto_reconnect,
            reconnect_backoff: self.backoff(),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            controller: self.controller,
            metadata: self.metadata.clone(),
            relay: RelayProtocolOptions {
                protocol: self.relay.protocol.clone(),
                params: None,
            },
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}
