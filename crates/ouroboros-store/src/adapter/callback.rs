//! Callback-style adapters and their async wrapper
//!
//! Some native clients report completion by invoking a callback with
//! `Result<T, E>` instead of returning a future. [`Promisified`] bridges each
//! callback into a oneshot channel so those backends satisfy [`Adapter`]
//! like any other.

use async_trait::async_trait;
use std::fmt::Display;
use tokio::sync::oneshot;
use tracing::error;

use super::{Adapter, BatchEntry, Capabilities};
use crate::error::{Result, StoreError};

/// Completion callback handed to a [`CallbackAdapter`] operation.
///
/// Must be invoked exactly once. Dropping it without a call is reported to
/// the awaiting caller as [`StoreError::Internal`].
pub type Completion<T, E> = Box<dyn FnOnce(std::result::Result<T, E>) + Send + 'static>;

/// Trait for backends whose native client completes through callbacks
pub trait CallbackAdapter: Send + Sync + 'static {
    /// Native error type; its `Display` output is what callers receive
    type Error: Display + Send + 'static;

    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    fn init(&self, done: Completion<(), Self::Error>);

    fn get(&self, key: String, done: Completion<Option<Vec<u8>>, Self::Error>);

    fn set(&self, key: String, value: Vec<u8>, done: Completion<(), Self::Error>);

    fn remove(&self, key: String, done: Completion<(), Self::Error>);

    fn write_batch(&self, entries: Vec<BatchEntry>, done: Completion<(), Self::Error>);

    /// Members of the set stored at `set_key`, sorted
    fn set_members(&self, set_key: String, done: Completion<Vec<String>, Self::Error>);

    fn close(&self, done: Completion<(), Self::Error>);
}

/// Async view of a [`CallbackAdapter`]
pub struct Promisified<C> {
    inner: C,
}

impl<C: CallbackAdapter> Promisified<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    /// Start a callback operation and wait for its completion
    async fn call<T, F>(&self, op: &'static str, start: F) -> Result<std::result::Result<T, C::Error>>
    where
        T: Send + 'static,
        F: FnOnce(Completion<T, C::Error>),
    {
        let (tx, rx) = oneshot::channel();
        start(Box::new(move |result| {
            // The receiver only goes away if the caller's future was dropped
            let _ = tx.send(result);
        }));

        rx.await.map_err(|_| {
            error!("{} {} completion dropped without a result", self.inner.name(), op);
            StoreError::Internal(format!(
                "{} dropped the completion for {}",
                self.inner.name(),
                op
            ))
        })
    }
}

fn backend_err<E: Display>(err: E) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn connection_err<E: Display>(err: E) -> StoreError {
    StoreError::Connection(err.to_string())
}

#[async_trait]
impl<C: CallbackAdapter> Adapter for Promisified<C> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn init(&self) -> Result<()> {
        self.call("init", |done| self.inner.init(done))
            .await?
            .map_err(connection_err)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.call("get", |done| self.inner.get(key, done))
            .await?
            .map_err(backend_err)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let key = key.to_string();
        self.call("set", |done| self.inner.set(key, value, done))
            .await?
            .map_err(backend_err)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.call("remove", |done| self.inner.remove(key, done))
            .await?
            .map_err(backend_err)
    }

    async fn write_batch(&self, entries: Vec<BatchEntry>) -> Result<()> {
        self.call("write_batch", |done| self.inner.write_batch(entries, done))
            .await?
            .map_err(backend_err)
    }

    async fn set_members(&self, set_key: &str) -> Result<Vec<String>> {
        let set_key = set_key.to_string();
        self.call("set_members", |done| self.inner.set_members(set_key, done))
            .await?
            .map_err(backend_err)
    }

    async fn close(&self) -> Result<()> {
        self.call("close", |done| self.inner.close(done))
            .await?
            .map_err(connection_err)
    }
}
