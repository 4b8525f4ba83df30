//! # Bus Configuration
//!
//! Typed configuration for the multiplexer, the channels, the shared store
//! backend and the retry queues. Every section deserializes with defaults so a
//! partial TOML file (or none at all) yields a usable configuration.
//!
//! ```toml
//! [multiplexer]
//! wait_timeout_ms = 1000
//!
//! [channel_defaults]
//! batch_size = 128
//!
//! [channels.PORT_TABLE]
//! priority = 10
//!
//! [store]
//! backend = "postgres"
//! database_url = "postgresql://localhost/orchbus"
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_NOTIFICATION_BUFFER_SIZE,
    DEFAULT_PRIORITY, DEFAULT_STUCK_THRESHOLD_SECS, DEFAULT_WAIT_TIMEOUT_MS,
    MAX_PAYLOAD_SIZE_LIMIT,
};

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub multiplexer: MultiplexerConfig,
    /// Settings applied to any table without its own `channels` entry
    pub channel_defaults: ChannelConfig,
    /// Per-table overrides keyed by table name
    pub channels: HashMap<String, ChannelConfig>,
    pub store: StoreConfig,
    pub retry: RetryConfig,
}

/// Event multiplexer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Upper bound on one blocking wait for readiness
    pub wait_timeout_ms: u64,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
        }
    }
}

impl MultiplexerConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Per-channel dispatch settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Maximum items popped per dispatch
    pub batch_size: usize,
    /// Higher values are dispatched preferentially
    pub priority: i32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            priority: DEFAULT_PRIORITY,
        }
    }
}

/// Which SharedStore backend to connect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    InMemory,
    Postgres,
}

/// Shared store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Bounded buffer per subscription; overflow drops notifications
    pub notification_buffer_size: usize,
    /// Largest payload a producer may publish
    pub max_payload_size: usize,
    /// Publish per-key change notifications on every mutation
    pub keyspace_notifications: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::InMemory,
            database_url: None,
            max_connections: 10,
            notification_buffer_size: DEFAULT_NOTIFICATION_BUFFER_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            keyspace_notifications: true,
        }
    }
}

/// Retry queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Parked items older than this are reported as stuck
    pub stuck_threshold_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            stuck_threshold_secs: DEFAULT_STUCK_THRESHOLD_SECS,
        }
    }
}

impl RetryConfig {
    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }
}

impl BusConfig {
    /// Settings for a table, falling back to `channel_defaults`
    ///
    /// Table names match case-insensitively since environment overrides
    /// arrive lowercased.
    pub fn channel(&self, table: &str) -> ChannelConfig {
        self.channels
            .get(table)
            .or_else(|| {
                self.channels
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(table))
                    .map(|(_, channel)| channel)
            })
            .copied()
            .unwrap_or(self.channel_defaults)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.multiplexer.wait_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "multiplexer.wait_timeout_ms",
                0,
                "wait timeout must be greater than 0",
            ));
        }

        if self.channel_defaults.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "channel_defaults.batch_size",
                0,
                "batch size must be greater than 0",
            ));
        }

        for (table, channel) in &self.channels {
            if channel.batch_size == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("channels.{table}.batch_size"),
                    0,
                    "batch size must be greater than 0",
                ));
            }
        }

        if self.store.notification_buffer_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "store.notification_buffer_size",
                0,
                "notification buffer must hold at least one notification",
            ));
        }

        if self.store.max_payload_size > MAX_PAYLOAD_SIZE_LIMIT {
            return Err(ConfigurationError::invalid_value(
                "store.max_payload_size",
                self.store.max_payload_size,
                format!("cannot exceed {MAX_PAYLOAD_SIZE_LIMIT} bytes"),
            ));
        }

        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return Err(ConfigurationError::missing_required_field(
                "store.database_url",
                "postgres store backend",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.multiplexer.wait_timeout(), Duration::from_secs(1));
        assert_eq!(config.channel_defaults.batch_size, 128);
        assert_eq!(config.store.backend, StoreBackend::InMemory);
    }

    #[test]
    fn test_channel_fallback() {
        let mut config = BusConfig::default();
        config.channels.insert(
            "PORT_TABLE".to_string(),
            ChannelConfig {
                batch_size: 16,
                priority: 10,
            },
        );

        assert_eq!(config.channel("PORT_TABLE").priority, 10);
        assert_eq!(config.channel("PORT_TABLE").batch_size, 16);
        assert_eq!(config.channel("ROUTE_TABLE"), ChannelConfig::default());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = BusConfig::default();
        config.channel_defaults.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = BusConfig::default();
        config.store.max_payload_size = 9000;
        assert!(config.validate().is_err());

        let mut config = BusConfig::default();
        config.store.backend = StoreBackend::Postgres;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::MissingRequiredField { .. })
        ));
        config.store.database_url = Some("postgresql://localhost/orchbus".to_string());
        assert!(config.validate().is_ok());
    }
}
