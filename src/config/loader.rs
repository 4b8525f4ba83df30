//! Configuration Loader
//!
//! Layers the built-in defaults, an optional TOML file and `ORCHBUS__*`
//! environment overrides with the `config` crate, then validates the result.

use config::{Config, Environment, File};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::BusConfig;

const ENV_PREFIX: &str = "ORCHBUS";
const ENV_SEPARATOR: &str = "__";

/// Loads [`BusConfig`] from file and environment
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
    env_overrides: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read this TOML file (it must exist)
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Use this map instead of the process environment
    ///
    /// Lets tests exercise overrides without mutating global state.
    pub fn with_env_overrides<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_overrides = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Build, deserialize and validate
    pub fn load(&self) -> ConfigResult<BusConfig> {
        let mut builder = Config::builder();

        if let Some(path) = &self.path {
            debug!(path = %path.display(), "Loading bus configuration file");
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }

        let mut environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true);
        if let Some(vars) = &self.env_overrides {
            environment = environment.source(Some(vars.clone().into_iter().collect()));
        }
        builder = builder.add_source(environment);

        let source_name = self
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "defaults".to_string());

        let config: BusConfig = builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| ConfigurationError::load_error(&source_name, e))?;

        config.validate()?;

        info!(
            source = %source_name,
            backend = ?config.store.backend,
            wait_timeout_ms = config.multiplexer.wait_timeout_ms,
            default_batch_size = config.channel_defaults.batch_size,
            configured_channels = config.channels.len(),
            "Bus configuration loaded"
        );

        Ok(config)
    }
}
