//! Redis backend
//!
//! Connection pooling through deadpool-redis. Batches are sent as a
//! MULTI/EXEC pipeline, and each namespace's key index lives in a native
//! Redis set that is maintained inside the same transaction.

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use parking_lot::RwLock;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::adapter::{Adapter, BatchEntry, Capabilities, IndexStrategy};
use crate::error::{Result, StoreError};

/// Redis backend configuration
///
/// `url` wins over the individual connection fields when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: u32,
    /// Connection pool size
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            pool_size: 10,
        }
    }
}

impl RedisConfig {
    /// Connection URL assembled from the config
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
            (None, Some(pass)) => format!(":{}@", pass),
            (Some(user), None) => format!("{}@", user),
            (None, None) => String::new(),
        };
        format!(
            "redis://{}{}:{}/{}",
            auth, self.host, self.port, self.database
        )
    }
}

/// Redis backend implementation
pub struct RedisAdapter {
    config: RedisConfig,
    pool: RwLock<Option<Pool>>,
}

impl RedisAdapter {
    pub fn new(config: RedisConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
        }
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<Connection> {
        let pool = self
            .pool
            .read()
            .clone()
            .ok_or_else(|| StoreError::Backend("Redis pool is not open".to_string()))?;
        pool.get()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to get connection: {}", e)))
    }
}

fn backend_err(op: &str) -> impl FnOnce(redis::RedisError) -> StoreError + '_ {
    move |e| StoreError::Backend(format!("Failed to {}: {}", op, e))
}

#[async_trait]
impl Adapter for RedisAdapter {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            is_async: true,
            native_batch: true,
            index: IndexStrategy::NativeSet,
        }
    }

    async fn init(&self) -> Result<()> {
        if self.pool.read().is_some() {
            return Err(StoreError::Connection("Redis pool already open".to_string()));
        }

        debug!(
            "Creating Redis pool: host={}, port={}, db={}, pool_size={}",
            self.config.host, self.config.port, self.config.database, self.config.pool_size
        );

        let pool = PoolConfig::from_url(self.config.connection_url())
            .builder()
            .map_err(|e| StoreError::Connection(format!("Failed to create pool builder: {}", e)))?
            .max_size(self.config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Connection(format!("Failed to create pool: {}", e)))?;

        // Test connection
        let mut conn = pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to get connection: {}", e)))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Connection(format!("PING failed: {}", e)))?;
        drop(conn);

        *self.pool.write() = Some(pool);
        info!(
            "Redis backend connected to {}:{}",
            self.config.host, self.config.port
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.get_conn().await?;
        conn.get(key).await.map_err(backend_err("get value"))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut conn = self.get_conn().await?;
        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(backend_err("set value"))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        conn.del::<_, ()>(key)
            .await
            .map_err(backend_err("delete value"))
    }

    async fn write_batch(&self, entries: Vec<BatchEntry>) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for entry in &entries {
            match entry {
                BatchEntry::Put { key, value } => pipe.set(key, value.as_slice()).ignore(),
                BatchEntry::Delete { key } => pipe.del(key).ignore(),
                BatchEntry::SetAdd { set_key, member } => pipe.sadd(set_key, member).ignore(),
                BatchEntry::SetRemove { set_key, member } => pipe.srem(set_key, member).ignore(),
            };
        }

        debug!("Executing MULTI/EXEC with {} commands", entries.len());
        let mut conn = self.get_conn().await?;
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(backend_err("execute batch"))?;
        Ok(())
    }

    async fn set_members(&self, set_key: &str) -> Result<Vec<String>> {
        let mut conn = self.get_conn().await?;
        conn.smembers(set_key)
            .await
            .map_err(backend_err("read set members"))
    }

    async fn close(&self) -> Result<()> {
        match self.pool.write().take() {
            Some(pool) => {
                pool.close();
                info!("Redis backend closed");
                Ok(())
            }
            None => Err(StoreError::Closed),
        }
    }
}
