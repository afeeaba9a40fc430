//! Backend configuration for runtime selection.
//!
//! # Example
//! ```rust,ignore
//! use ouroboros_store::BackendConfig;
//!
//! // From environment
//! let config = BackendConfig::from_env()?;
//!
//! // Or from a backend name and its options
//! let config = BackendConfig::from_settings("disk", json!({"directory": "/tmp/store"}))?;
//!
//! let adapter = config.into_adapter();
//! ```

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::adapter::{Adapter, Promisified};
use crate::backends::{
    DiskConfig, DiskStore, KvServerAdapter, KvServerConfig, MemoryAdapter, MemoryConfig,
};
use crate::error::{Result, StoreError};

#[cfg(feature = "redis")]
use crate::backends::{RedisAdapter, RedisConfig};

/// Unified backend configuration enum.
///
/// One variant per backend compiled into the crate.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// In-process ordered map
    Memory(MemoryConfig),

    /// Embedded append-only log
    Disk(DiskConfig),

    /// Remote ouroboros KV server
    KvServer(KvServerConfig),

    /// Redis server
    #[cfg(feature = "redis")]
    Redis(RedisConfig),
}

impl BackendConfig {
    /// Build a configuration from a backend name and its opaque options.
    ///
    /// `null` settings mean defaults. Fields a backend does not know are ignored.
    pub fn from_settings(name: &str, settings: Value) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "memory" | "mem" => Ok(BackendConfig::Memory(parse_settings(name, settings)?)),
            "disk" => Ok(BackendConfig::Disk(parse_settings(name, settings)?)),
            "kvserver" | "kv" => Ok(BackendConfig::KvServer(parse_settings(name, settings)?)),

            #[cfg(feature = "redis")]
            "redis" => Ok(BackendConfig::Redis(parse_settings(name, settings)?)),

            other => Err(StoreError::Configuration(format!(
                "Unknown backend type: '{}'. Available types: {}",
                other,
                Self::available_types().join(", ")
            ))),
        }
    }

    /// Create backend configuration from environment variables.
    ///
    /// `STORE_BACKEND` names the backend (default `memory`) and
    /// `STORE_SETTINGS` holds its options as a JSON object.
    pub fn from_env() -> Result<Self> {
        let backend = std::env::var("STORE_BACKEND").unwrap_or_else(|_| "memory".to_string());
        let settings = match std::env::var("STORE_SETTINGS") {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw).map_err(|e| {
                StoreError::Configuration(format!("STORE_SETTINGS is not valid JSON: {}", e))
            })?,
            _ => Value::Null,
        };
        Self::from_settings(&backend, settings)
    }

    /// Returns list of available backend types based on compiled features.
    #[allow(clippy::vec_init_then_push, unused_mut)]
    pub fn available_types() -> Vec<&'static str> {
        let mut types = vec!["memory", "disk", "kvserver"];

        #[cfg(feature = "redis")]
        types.push("redis");

        types
    }

    /// Get the backend type as a string.
    pub fn backend_type(&self) -> &'static str {
        match self {
            BackendConfig::Memory(_) => "memory",
            BackendConfig::Disk(_) => "disk",
            BackendConfig::KvServer(_) => "kvserver",

            #[cfg(feature = "redis")]
            BackendConfig::Redis(_) => "redis",
        }
    }

    /// Create the concrete adapter for this configuration.
    ///
    /// Callback-style backends come back already wrapped in [`Promisified`].
    pub fn into_adapter(self) -> AdapterInstance {
        match self {
            BackendConfig::Memory(config) => AdapterInstance::Memory(MemoryAdapter::new(config)),
            BackendConfig::Disk(config) => {
                AdapterInstance::Disk(Promisified::new(DiskStore::new(config)))
            }
            BackendConfig::KvServer(config) => {
                AdapterInstance::KvServer(KvServerAdapter::new(config))
            }

            #[cfg(feature = "redis")]
            BackendConfig::Redis(config) => {
                AdapterInstance::Redis(Box::new(RedisAdapter::new(config)))
            }
        }
    }
}

fn parse_settings<T>(name: &str, settings: Value) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if settings.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(settings)
        .map_err(|e| StoreError::Configuration(format!("Invalid {} settings: {}", name, e)))
}

/// Concrete adapter instance.
///
/// Closed set of backends; the database holds one of these and talks to it
/// through [`AdapterInstance::as_adapter`].
pub enum AdapterInstance {
    Memory(MemoryAdapter),
    Disk(Promisified<DiskStore>),
    KvServer(KvServerAdapter),

    #[cfg(feature = "redis")]
    Redis(Box<RedisAdapter>),
}

impl AdapterInstance {
    pub fn as_adapter(&self) -> &dyn Adapter {
        match self {
            AdapterInstance::Memory(adapter) => adapter,
            AdapterInstance::Disk(adapter) => adapter,
            AdapterInstance::KvServer(adapter) => adapter,

            #[cfg(feature = "redis")]
            AdapterInstance::Redis(adapter) => adapter.as_ref(),
        }
    }
}

impl std::fmt::Debug for AdapterInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let adapter = self.as_adapter();
        f.debug_struct("AdapterInstance")
            .field("name", &adapter.name())
            .field("capabilities", &adapter.capabilities())
            .finish()
    }
}
