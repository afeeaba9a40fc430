//! Adapter contract
//!
//! Every storage backend is reached through the [`Adapter`] trait. Backends
//! whose native client completes through callbacks implement
//! [`CallbackAdapter`] instead and are wrapped by [`Promisified`], so callers
//! only ever see one async contract.

pub mod callback;

use async_trait::async_trait;

use crate::error::{Result, StoreError};

pub use callback::{CallbackAdapter, Completion, Promisified};

/// How a backend answers `"namespace:*"` enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStrategy {
    /// Backend supports ordered prefix scans; no side table is kept
    NativeScan,
    /// Side table held in a native set type (`index:keys:<ns>` is a set)
    NativeSet,
    /// Side table held as a JSON encoded, sorted list under `index:keys:<ns>`
    SerializedList,
}

/// Backend feature capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Native client completes through futures rather than callbacks
    pub is_async: bool,
    /// Supports atomic multi-command batches (`write_batch`)
    pub native_batch: bool,
    /// How prefix enumeration is resolved
    pub index: IndexStrategy,
}

/// One entry of a native atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEntry {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
    /// Add `member` to the native set stored at `set_key`
    SetAdd { set_key: String, member: String },
    /// Remove `member` from the native set stored at `set_key`
    SetRemove { set_key: String, member: String },
}

impl BatchEntry {
    /// Key touched by this entry
    pub fn key(&self) -> &str {
        match self {
            BatchEntry::Put { key, .. } | BatchEntry::Delete { key } => key,
            BatchEntry::SetAdd { set_key, .. } | BatchEntry::SetRemove { set_key, .. } => set_key,
        }
    }
}

/// Trait for storage backend implementations
///
/// Adapters own their connection or handle. `init` is called exactly once
/// before any other method and `close` exactly once at the end; the
/// [`Database`](crate::Database) facade enforces that ordering.
///
/// Adapters add no locking of their own: concurrent calls on the same key
/// are serialized only if the backend serializes them.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Backend name used in logs and errors
    fn name(&self) -> &'static str;

    /// Get the capabilities of this backend
    fn capabilities(&self) -> Capabilities;

    /// Open the backend using the options it was constructed with
    async fn init(&self) -> Result<()>;

    /// Get a value; a missing key is `Ok(None)`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value, overwriting any previous one
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete a key; deleting a missing key succeeds
    async fn remove(&self, key: &str) -> Result<()>;

    /// Apply all entries as one unit: either every entry takes effect or none does.
    ///
    /// Only called when `capabilities().native_batch` is true.
    async fn write_batch(&self, entries: Vec<BatchEntry>) -> Result<()> {
        let _ = entries;
        Err(StoreError::Internal(format!(
            "{} does not support native batches",
            self.name()
        )))
    }

    /// List every key starting with `prefix`.
    ///
    /// Only called for [`IndexStrategy::NativeScan`].
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let _ = prefix;
        Err(StoreError::Internal(format!(
            "{} does not support prefix scans",
            self.name()
        )))
    }

    /// Read the members of the native set at `set_key` (empty if absent).
    ///
    /// Only called for [`IndexStrategy::NativeSet`].
    async fn set_members(&self, set_key: &str) -> Result<Vec<String>> {
        let _ = set_key;
        Err(StoreError::Internal(format!(
            "{} does not support native sets",
            self.name()
        )))
    }

    /// Release the backend handle
    async fn close(&self) -> Result<()>;
}
