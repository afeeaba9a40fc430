//! Database facade
//!
//! The public entry point: one handle per backend binding, with an explicit
//! `Created -> Opening -> Open -> Closed` lifecycle. Calls made outside the
//! `Open` state fail with a usage error instead of reaching the backend.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::adapter::{Adapter, Capabilities};
use crate::bulk::{self, BulkOperation, BulkReport};
use crate::config::{AdapterInstance, BackendConfig};
use crate::error::{Result, StoreError};
use crate::index;

enum State {
    Created,
    Opening,
    Open(AdapterInstance),
    Closed,
}

impl State {
    fn adapter(&self) -> Result<&dyn Adapter> {
        match self {
            State::Open(instance) => Ok(instance.as_adapter()),
            State::Created | State::Opening => Err(StoreError::NotInitialized),
            State::Closed => Err(StoreError::Closed),
        }
    }
}

/// Key-value database bound to a single backend
pub struct Database {
    backend: &'static str,
    state: RwLock<State>,
}

impl Database {
    /// Select a backend by name. Nothing is opened until [`Database::init`].
    pub fn new(backend: &str) -> Result<Self> {
        let config = BackendConfig::from_settings(backend, Value::Null)?;
        Ok(Self {
            backend: config.backend_type(),
            state: RwLock::new(State::Created),
        })
    }

    /// Backend type this database is bound to
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Open the backend with its options (`null` for defaults).
    pub async fn init(&self, settings: Value) -> Result<()> {
        let config = BackendConfig::from_settings(self.backend, settings)?;
        self.init_with(config).await
    }

    /// Open the backend with an already typed configuration.
    ///
    /// A failed open leaves the database closed; create a new one to retry.
    pub async fn init_with(&self, config: BackendConfig) -> Result<()> {
        if config.backend_type() != self.backend {
            return Err(StoreError::Configuration(format!(
                "database uses the '{}' backend, got '{}' settings",
                self.backend,
                config.backend_type()
            )));
        }

        {
            let mut state = self.state.write().await;
            match *state {
                State::Created => *state = State::Opening,
                State::Opening | State::Open(_) => return Err(StoreError::AlreadyInitialized),
                State::Closed => return Err(StoreError::Closed),
            }
        }

        let instance = config.into_adapter();
        let opened = instance.as_adapter().init().await;

        let mut state = self.state.write().await;
        match opened {
            Ok(()) => {
                let caps = instance.as_adapter().capabilities();
                info!(
                    "Database opened: backend={}, completion={}, native_batch={}, index={:?}",
                    self.backend,
                    if caps.is_async { "future" } else { "callback" },
                    caps.native_batch,
                    caps.index
                );
                *state = State::Open(instance);
                Ok(())
            }
            Err(e) => {
                error!("Failed to open {} backend: {}", self.backend, e);
                *state = State::Closed;
                Err(e)
            }
        }
    }

    /// Capabilities of the open backend
    pub async fn capabilities(&self) -> Result<Capabilities> {
        let state = self.state.read().await;
        Ok(state.adapter()?.capabilities())
    }

    pub async fn is_open(&self) -> bool {
        matches!(*self.state.read().await, State::Open(_))
    }

    /// Read a value; a missing key is `Ok(None)`
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        index::validate_key(key)?;
        let state = self.state.read().await;
        state.adapter()?.get(key).await
    }

    /// Write a value, keeping the namespace index in step
    ///
    /// On `SerializedList` backends (`kvserver`) the index update is a
    /// read-modify-write: concurrent calls writing keys of the same namespace
    /// can lose index entries, so `find_keys` may miss keys that exist.
    pub async fn set(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        index::validate_key(key)?;
        let state = self.state.read().await;
        bulk::write_one(state.adapter()?, BulkOperation::set(key, value)).await
    }

    /// Delete a key; deleting a missing key succeeds
    ///
    /// Shares the lost-update hazard described on [`Database::set`].
    pub async fn remove(&self, key: &str) -> Result<()> {
        index::validate_key(key)?;
        let state = self.state.read().await;
        bulk::write_one(state.adapter()?, BulkOperation::remove(key)).await
    }

    /// Apply `ops` in order as one bulk call.
    ///
    /// Atomic on backends with a native batch. Elsewhere a failure returns
    /// [`StoreError::PartialBulk`] and the operations before it stay applied.
    pub async fn do_bulk(&self, ops: Vec<BulkOperation>) -> Result<BulkReport> {
        for op in &ops {
            index::validate_key(op.key())?;
        }
        let state = self.state.read().await;
        bulk::execute(state.adapter()?, ops).await
    }

    /// Keys matching `"<namespace>:*"`, minus those matching `exclude`
    pub async fn find_keys(&self, pattern: &str, exclude: Option<&str>) -> Result<BTreeSet<String>> {
        let state = self.state.read().await;
        index::find_keys(state.adapter()?, pattern, exclude).await
    }

    /// Read a JSON-encoded value
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(format!("'{}': {}", key, e))),
            None => Ok(None),
        }
    }

    /// Write a value as JSON
    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes).await
    }

    /// Release the backend. Waits for in-flight operations to finish.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;
        match std::mem::replace(&mut *state, State::Closed) {
            State::Open(instance) => {
                let result = instance.as_adapter().close().await;
                match &result {
                    Ok(()) => info!("Database closed: backend={}", self.backend),
                    Err(e) => error!("Error closing {} backend: {}", self.backend, e),
                }
                result
            }
            State::Closed => Err(StoreError::Closed),
            pending @ (State::Created | State::Opening) => {
                debug!("close() called before init on {} backend", self.backend);
                *state = pending;
                Err(StoreError::NotInitialized)
            }
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("backend", &self.backend)
            .finish()
    }
}
