//! In-memory backend
//!
//! An ordered map behind a single `RwLock`. Batches are validated up front
//! and applied under one write lock, so they are atomic; prefix enumeration
//! uses the map's native range scan.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use tracing::debug;

use crate::adapter::{Adapter, BatchEntry, Capabilities, IndexStrategy};
use crate::error::{Result, StoreError};

/// In-memory backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Reject values larger than this many bytes
    pub max_value_size: Option<usize>,
}

/// In-memory backend implementation
pub struct MemoryAdapter {
    config: MemoryConfig,
    data: RwLock<Option<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryAdapter {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            data: RwLock::new(None),
        }
    }

    fn check_value(&self, key: &str, value: &[u8]) -> Result<()> {
        match self.config.max_value_size {
            Some(max) if value.len() > max => Err(StoreError::Backend(format!(
                "value for '{}' is {} bytes (max {})",
                key,
                value.len(),
                max
            ))),
            _ => Ok(()),
        }
    }
}

fn not_open() -> StoreError {
    StoreError::Backend("memory store is not open".to_string())
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            is_async: true,
            native_batch: true,
            index: IndexStrategy::NativeScan,
        }
    }

    async fn init(&self) -> Result<()> {
        let mut data = self.data.write();
        if data.is_some() {
            return Err(StoreError::Connection("memory store already open".to_string()));
        }
        *data = Some(BTreeMap::new());
        debug!("Memory store opened");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self.data.read();
        Ok(data.as_ref().ok_or_else(not_open)?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_value(key, &value)?;
        let mut data = self.data.write();
        data.as_mut()
            .ok_or_else(not_open)?
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut data = self.data.write();
        data.as_mut().ok_or_else(not_open)?.remove(key);
        Ok(())
    }

    async fn write_batch(&self, entries: Vec<BatchEntry>) -> Result<()> {
        // Validate everything before touching the map
        for entry in &entries {
            match entry {
                BatchEntry::Put { key, value } => self.check_value(key, value)?,
                BatchEntry::Delete { .. } => {}
                BatchEntry::SetAdd { set_key, .. } | BatchEntry::SetRemove { set_key, .. } => {
                    return Err(StoreError::Backend(format!(
                        "memory store has no native sets ('{}')",
                        set_key
                    )));
                }
            }
        }

        let mut data = self.data.write();
        let map = data.as_mut().ok_or_else(not_open)?;
        for entry in entries {
            match entry {
                BatchEntry::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchEntry::Delete { key } => {
                    map.remove(&key);
                }
                BatchEntry::SetAdd { .. } | BatchEntry::SetRemove { .. } => {}
            }
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let data = self.data.read();
        let map = data.as_ref().ok_or_else(not_open)?;
        Ok(map
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn close(&self) -> Result<()> {
        match self.data.write().take() {
            Some(map) => {
                debug!("Memory store closed ({} keys dropped)", map.len());
                Ok(())
            }
            None => Err(StoreError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open() -> MemoryAdapter {
        let adapter = MemoryAdapter::new(MemoryConfig::default());
        adapter.init().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let adapter = open().await;
        adapter.set("k", b"v".to_vec()).await.unwrap();
        assert_eq!(adapter.get("k").await.unwrap(), Some(b"v".to_vec()));
        adapter.remove("k").await.unwrap();
        assert_eq!(adapter.get("k").await.unwrap(), None);
        // Idempotent
        adapter.remove("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_prefix() {
        let adapter = open().await;
        for key in ["user:1", "user:2", "users:1", "usep", "user"] {
            adapter.set(key, Vec::new()).await.unwrap();
        }
        let keys = adapter.scan_prefix("user:").await.unwrap();
        assert_eq!(keys, vec!["user:1".to_string(), "user:2".to_string()]);
    }

    #[tokio::test]
    async fn test_batch_rejected_as_a_whole() {
        let adapter = MemoryAdapter::new(MemoryConfig {
            max_value_size: Some(4),
        });
        adapter.init().await.unwrap();
        adapter.set("old", b"x".to_vec()).await.unwrap();

        let result = adapter
            .write_batch(vec![
                BatchEntry::Put {
                    key: "small".to_string(),
                    value: b"ok".to_vec(),
                },
                BatchEntry::Delete {
                    key: "old".to_string(),
                },
                BatchEntry::Put {
                    key: "big".to_string(),
                    value: b"too large".to_vec(),
                },
            ])
            .await;

        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert_eq!(adapter.get("small").await.unwrap(), None);
        assert_eq!(adapter.get("old").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_use_before_init_and_double_close() {
        let adapter = MemoryAdapter::new(MemoryConfig::default());
        assert!(adapter.get("k").await.is_err());

        adapter.init().await.unwrap();
        adapter.close().await.unwrap();
        assert!(matches!(adapter.close().await, Err(StoreError::Closed)));
    }
}
