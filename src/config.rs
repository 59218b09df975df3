//! TOML configuration for registries and channels.
//!
//! Every field has a default, so an empty file is a valid config:
//!
//! ```toml
//! [registry]
//! initial_capacity = 16
//!
//! [channel]
//! capacity = 64
//! put_timeout_ms = 500
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::context::Context;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub registry: RegistryConfig,
    pub channel: ChannelConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Slots to preallocate; 0 leaves sizing to the map.
    pub initial_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    pub capacity: usize,
    /// Upper bound on a blocked `put`; unset means wait forever.
    pub put_timeout_ms: Option<u64>,
    /// Upper bound on a blocked `take`; unset means wait forever.
    pub take_timeout_ms: Option<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            capacity: 64,
            put_timeout_ms: None,
            take_timeout_ms: None,
        }
    }
}

impl ChannelConfig {
    pub fn put_context(&self) -> Context {
        timeout_context(self.put_timeout_ms)
    }

    pub fn take_context(&self) -> Context {
        timeout_context(self.take_timeout_ms)
    }
}

fn timeout_context(timeout_ms: Option<u64>) -> Context {
    match timeout_ms {
        Some(ms) => Context::with_timeout(Duration::from_millis(ms)),
        None => Context::background(),
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "channel.capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.channel.put_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "channel.put_timeout_ms",
                reason: "use a positive timeout or leave it unset".into(),
            });
        }
        if self.channel.take_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "channel.take_timeout_ms",
                reason: "use a positive timeout or leave it unset".into(),
            });
        }
        Ok(())
    }
}
