//! Bulk operations
//!
//! A bulk call is an ordered list of set/remove operations. On backends with
//! a native atomic batch the whole list, together with the index mutations
//! it implies, is submitted as one unit: every entry takes effect or none
//! does.
//!
//! Backends without a native batch get a sequential fallback. Operations run
//! in input order and the first failure stops the run with
//! [`StoreError::PartialBulk`]. **Operations applied before the failure are
//! not rolled back**; `applied` in the error says how many committed.
//!
//! Repeated keys inside one call resolve last-write-wins in input order on
//! both paths.

use std::slice;
use tracing::{debug, warn};

use crate::adapter::{Adapter, BatchEntry, IndexStrategy};
use crate::error::{Result, StoreError};
use crate::index;

/// One operation of a bulk call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOperation {
    Set { key: String, value: Vec<u8> },
    Remove { key: String },
}

impl BulkOperation {
    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        BulkOperation::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        BulkOperation::Remove { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            BulkOperation::Set { key, .. } | BulkOperation::Remove { key } => key,
        }
    }
}

/// Guarantee a bulk call ran under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atomicity {
    /// Committed as a single native batch
    Atomic,
    /// Applied one operation at a time; a failure would have left a prefix applied
    Sequential,
}

/// Outcome of a successful bulk call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkReport {
    pub atomicity: Atomicity,
    /// Number of operations committed
    pub operations: usize,
}

impl BulkReport {
    pub fn is_atomic(&self) -> bool {
        self.atomicity == Atomicity::Atomic
    }
}

/// Run a bulk call against the adapter
pub async fn execute(adapter: &dyn Adapter, ops: Vec<BulkOperation>) -> Result<BulkReport> {
    let caps = adapter.capabilities();
    let atomicity = if caps.native_batch {
        Atomicity::Atomic
    } else {
        Atomicity::Sequential
    };
    let total = ops.len();

    if ops.is_empty() {
        return Ok(BulkReport {
            atomicity,
            operations: 0,
        });
    }

    if caps.native_batch {
        let index_entries = index::index_entries(adapter, &ops).await?;
        let mut entries: Vec<BatchEntry> = Vec::with_capacity(total + index_entries.len());
        entries.extend(ops.into_iter().map(primary_entry));
        entries.extend(index_entries);

        debug!(
            "{}: submitting native batch of {} entries for {} operations",
            adapter.name(),
            entries.len(),
            total
        );
        adapter.write_batch(entries).await?;
    } else {
        for (applied, op) in ops.into_iter().enumerate() {
            if let Err(e) = apply_sequential(adapter, op).await {
                warn!(
                    "{}: bulk stopped after {} of {} operations: {}",
                    adapter.name(),
                    applied,
                    total,
                    e
                );
                return Err(StoreError::PartialBulk {
                    applied,
                    total,
                    source: Box::new(e),
                });
            }
        }
    }

    Ok(BulkReport {
        atomicity,
        operations: total,
    })
}

/// Apply a single set/remove together with its index mutation
pub async fn write_one(adapter: &dyn Adapter, op: BulkOperation) -> Result<()> {
    let caps = adapter.capabilities();
    let needs_index =
        caps.index != IndexStrategy::NativeScan && index::parse_indexable(op.key()).is_some();

    if !needs_index {
        return apply_primary(adapter, op).await;
    }

    if caps.native_batch {
        execute(adapter, vec![op]).await.map(|_| ())
    } else {
        apply_sequential(adapter, op).await
    }
}

fn primary_entry(op: BulkOperation) -> BatchEntry {
    match op {
        BulkOperation::Set { key, value } => BatchEntry::Put { key, value },
        BulkOperation::Remove { key } => BatchEntry::Delete { key },
    }
}

async fn apply_primary(adapter: &dyn Adapter, op: BulkOperation) -> Result<()> {
    match op {
        BulkOperation::Set { key, value } => adapter.set(&key, value).await,
        BulkOperation::Remove { key } => adapter.remove(&key).await,
    }
}

/// Primary write immediately followed by its index entries
async fn apply_sequential(adapter: &dyn Adapter, op: BulkOperation) -> Result<()> {
    let index_entries = index::index_entries(adapter, slice::from_ref(&op)).await?;
    apply_primary(adapter, op).await?;
    for entry in index_entries {
        apply_entry(adapter, entry).await?;
    }
    Ok(())
}

async fn apply_entry(adapter: &dyn Adapter, entry: BatchEntry) -> Result<()> {
    match entry {
        BatchEntry::Put { key, value } => adapter.set(&key, value).await,
        BatchEntry::Delete { key } => adapter.remove(&key).await,
        // Native set indexes only exist on backends with native batches
        set_entry @ (BatchEntry::SetAdd { .. } | BatchEntry::SetRemove { .. }) => {
            adapter.write_batch(vec![set_entry]).await
        }
    }
}
