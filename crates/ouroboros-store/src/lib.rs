//! ouroboros-store: one key-value contract over interchangeable backends
//!
//! # Features
//! - Uniform async `get`/`set`/`remove` over in-memory, on-disk and networked stores
//! - Bulk calls that are atomic where the backend has a native batch, and
//!   report partial application where it does not
//! - `"namespace:*"` key enumeration, emulated through a side index on
//!   backends without range scans
//! - Callback-style backends adapted to the same async contract
//!
//! # Example
//! ```rust,ignore
//! use ouroboros_store::{BulkOperation, Database};
//! use serde_json::json;
//!
//! let db = Database::new("disk")?;
//! db.init(json!({"directory": "/var/lib/app"})).await?;
//!
//! db.set("user:1", "ada").await?;
//! db.do_bulk(vec![
//!     BulkOperation::set("user:2", "grace"),
//!     BulkOperation::remove("user:1"),
//! ]).await?;
//!
//! let users = db.find_keys("user:*", None).await?;
//! db.close().await?;
//! ```

pub mod adapter;
pub mod backends;
pub mod bulk;
pub mod config;
pub mod database;
pub mod error;
pub mod index;

pub use adapter::{
    Adapter, BatchEntry, CallbackAdapter, Capabilities, Completion, IndexStrategy, Promisified,
};
pub use bulk::{Atomicity, BulkOperation, BulkReport};
pub use config::{AdapterInstance, BackendConfig};
pub use database::Database;
pub use error::{Result, StoreError};
pub use index::{PatternQuery, EXCLUDE_SUBKEYS, INDEX_PREFIX};
