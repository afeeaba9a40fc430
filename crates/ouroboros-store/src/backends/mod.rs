//! Storage backend implementations

pub mod disk;
pub mod kvserver;
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use disk::{DiskConfig, DiskError, DiskStore};
pub use kvserver::{KvServerAdapter, KvServerConfig};
pub use memory::{MemoryAdapter, MemoryConfig};

#[cfg(feature = "redis")]
pub use self::redis::{RedisAdapter, RedisConfig};
