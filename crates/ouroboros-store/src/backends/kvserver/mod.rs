//! Remote ouroboros KV server backend
//!
//! Talks the server's binary TCP protocol over a single connection.
//! Requests are serialized on that connection. The server has no batch
//! command, so bulk calls take the sequential path and the key index is
//! kept as a serialized list under `index:keys:<ns>`.
//!
//! Updating that list is a read-modify-write across two round trips with no
//! server-side lock. Concurrent writers of indexable keys in the same
//! namespace, whether tasks sharing this adapter or separate processes, can
//! overwrite each other's list and lose index entries (the values themselves
//! are not lost). Serialize such writes in the caller when `find_keys` must
//! stay exact.

pub mod protocol;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::adapter::{Adapter, Capabilities, IndexStrategy};
use crate::error::{Result, StoreError};
use protocol::{Command, ProtocolError, Status};

/// KV server backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvServerConfig {
    pub host: String,
    pub port: u16,
    /// Prefix every key as `<namespace>:<key>` on the server
    pub namespace: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for KvServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6380,
            namespace: None,
            connect_timeout_ms: 5_000,
        }
    }
}

impl KvServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<ProtocolError> for StoreError {
    fn from(err: ProtocolError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// KV server backend implementation
pub struct KvServerAdapter {
    config: KvServerConfig,
    stream: Mutex<Option<TcpStream>>,
}

impl KvServerAdapter {
    pub fn new(config: KvServerConfig) -> Self {
        Self {
            config,
            stream: Mutex::new(None),
        }
    }

    fn server_key(&self, key: &str) -> String {
        match &self.config.namespace {
            Some(ns) => format!("{}:{}", ns, key),
            None => key.to_string(),
        }
    }

    /// Send one request and wait for its response
    async fn request(&self, command: Command, payload: &[u8]) -> Result<(Status, Vec<u8>)> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| StoreError::Backend("not connected to KV server".to_string()))?;

        let result = async {
            protocol::write_frame(stream, command as u8, payload).await?;
            let (status, body) = protocol::read_frame(stream).await?;
            Ok::<_, ProtocolError>((Status::try_from(status)?, body))
        }
        .await;

        match result {
            Ok((Status::Error, body)) => Err(StoreError::Backend(format!(
                "KV server error: {}",
                String::from_utf8_lossy(&body)
            ))),
            Ok(response) => Ok(response),
            Err(e) => {
                // The stream position is unknown after a transport failure
                *guard = None;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl Adapter for KvServerAdapter {
    fn name(&self) -> &'static str {
        "kvserver"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            is_async: true,
            native_batch: false,
            index: IndexStrategy::SerializedList,
        }
    }

    async fn init(&self) -> Result<()> {
        let addr = self.config.address();
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| StoreError::Connection(format!("timed out connecting to {}", addr)))?
            .map_err(|e| StoreError::Connection(format!("failed to connect to {}: {}", addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        {
            let mut guard = self.stream.lock().await;
            if guard.is_some() {
                return Err(StoreError::Connection(format!(
                    "already connected to {}",
                    addr
                )));
            }
            *guard = Some(stream);
        }

        self.request(Command::Ping, &[])
            .await
            .map_err(|e| StoreError::Connection(format!("ping to {} failed: {}", addr, e)))?;

        info!("Connected to KV server at {}", addr);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = self.server_key(key);
        match self.request(Command::Get, key.as_bytes()).await? {
            (Status::Ok, body) => Ok(Some(protocol::decode_bytes(&body)?)),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let payload = protocol::set_payload(&self.server_key(key), &value)?;
        self.request(Command::Set, &payload).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = self.server_key(key);
        self.request(Command::Del, key.as_bytes()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let stream = self.stream.lock().await.take();
        match stream {
            Some(mut stream) => {
                if let Err(e) = stream.shutdown().await {
                    debug!("KV server connection shutdown: {}", e);
                }
                info!("Disconnected from KV server at {}", self.config.address());
                Ok(())
            }
            None => Err(StoreError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = KvServerConfig::default();
        assert_eq!(config.address(), "127.0.0.1:6380");
        assert_eq!(config.connect_timeout_ms, 5_000);
        assert!(config.namespace.is_none());
    }

    #[test]
    fn test_config_partial_json() {
        let config: KvServerConfig =
            serde_json::from_value(serde_json::json!({"port": 7000, "namespace": "app"}))
                .unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 7000);
        assert_eq!(config.namespace.as_deref(), Some("app"));
    }

    #[test]
    fn test_server_key_namespacing() {
        let plain = KvServerAdapter::new(KvServerConfig::default());
        assert_eq!(plain.server_key("user:1"), "user:1");

        let scoped = KvServerAdapter::new(KvServerConfig {
            namespace: Some("app".to_string()),
            ..Default::default()
        });
        assert_eq!(scoped.server_key("user:1"), "app:user:1");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let adapter = KvServerAdapter::new(KvServerConfig {
            port,
            ..Default::default()
        });
        assert!(matches!(adapter.init().await, Err(StoreError::Connection(_))));
    }

    #[tokio::test]
    async fn test_use_without_connection() {
        let adapter = KvServerAdapter::new(KvServerConfig::default());
        assert!(matches!(
            adapter.get("k").await,
            Err(StoreError::Backend(_))
        ));
        assert!(matches!(adapter.close().await, Err(StoreError::Closed)));
    }
}
