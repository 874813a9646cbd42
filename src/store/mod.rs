//! Resource store adapter: typed CRUD + watch over versioned objects.
//!
//! The engine never assumes more of its backing store than the capability
//! set defined here: independent, optimistically-versioned objects and a
//! watch/notify primitive. There are no cross-object transactions; every
//! protocol built on top is designed to be safely re-driven to a fixed
//! point instead.
//!
//! [`memory::MemoryStore`] provides the in-memory implementation used in
//! tests and embeddings; any backend satisfying [`ResourceStore`] works.

pub mod cluster;
pub mod memory;
pub mod retry;

use async_trait::async_trait;
use std::fmt::Display;
use std::hash::Hash;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::Meta;

pub use cluster::Cluster;
pub use memory::MemoryStore;
pub use retry::RetryConfig;

/// Capacity of a store's watch channel. Receivers that lag beyond this are
/// healed by the workers' periodic resync.
pub const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// A storable resource: identity plus store-maintained metadata.
pub trait Resource: Clone + Send + Sync + 'static {
    type Id: Clone + Eq + Hash + Ord + Display + Send + Sync + 'static;

    /// Resource kind name, used in error messages and logging.
    const KIND: &'static str;

    fn resource_id(&self) -> Self::Id;
    fn meta(&self) -> &Meta;
    fn meta_mut(&mut self) -> &mut Meta;
}

/// Errors that can occur in store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A write raced a concurrent update: the supplied version is stale.
    /// Transient; re-read and retry.
    #[error("version conflict on {kind} {id}: expected version {expected}, stored {stored}")]
    Conflict {
        kind: &'static str,
        id: String,
        expected: u64,
        stored: u64,
    },

    /// The addressed object does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Create raced a concurrent create of the same identity.
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },
}

impl StoreError {
    /// Transient errors are retried with backoff; they are invisible to the
    /// user when resolved within the retry bound.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict { .. } | StoreError::AlreadyExists { .. }
        )
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Change notification emitted by a store's watch stream.
///
/// Events carry identities only; consumers re-read current state, so a
/// coalesced or lost event is at worst a delayed wake-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent<Id> {
    Created(Id),
    Updated(Id),
    Deleted(Id),
}

impl<Id: Clone> StoreEvent<Id> {
    pub fn id(&self) -> &Id {
        match self {
            StoreEvent::Created(id) | StoreEvent::Updated(id) | StoreEvent::Deleted(id) => id,
        }
    }
}

/// The store capability set the engine is written against.
#[async_trait]
pub trait ResourceStore<T: Resource>: Send + Sync {
    /// Reads one object. `None` if it does not exist.
    async fn get(&self, id: &T::Id) -> StoreResult<Option<T>>;

    /// Lists all objects of the kind.
    async fn list(&self) -> StoreResult<Vec<T>>;

    /// Creates a new object. The stored version starts at 1.
    async fn create(&self, obj: T) -> StoreResult<T>;

    /// Replaces an object if the supplied version matches the stored one.
    /// The stored version is bumped on success.
    async fn update(&self, obj: T) -> StoreResult<T>;

    /// Removes an object if the supplied version matches the stored one.
    async fn delete(&self, id: &T::Id, expected_version: u64) -> StoreResult<()>;

    /// Subscribes to change notifications.
    fn watch(&self) -> broadcast::Receiver<StoreEvent<T::Id>>;
}

/// Re-read/mutate/update loop with bounded backoff for version conflicts.
///
/// `mutate` returns `false` to skip the write (nothing to change). Returns
/// the written (or unchanged) object, or `None` if it no longer exists.
pub async fn update_with_retry<T, F>(
    store: &dyn ResourceStore<T>,
    id: &T::Id,
    retry: &RetryConfig,
    mut mutate: F,
) -> StoreResult<Option<T>>
where
    T: Resource,
    F: FnMut(&mut T) -> bool + Send,
{
    let mut attempt = 0u32;
    loop {
        let Some(mut obj) = store.get(id).await? else {
            return Ok(None);
        };

        if !mutate(&mut obj) {
            return Ok(Some(obj));
        }

        match store.update(obj).await {
            Ok(written) => return Ok(Some(written)),
            Err(err) if err.is_transient() && attempt < retry.max_retries => {
                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Creates or replaces an object regardless of current version.
///
/// Used by the propagation broker, whose objects are write-once-per-cycle by
/// a single producer: a new cycle supersedes the previous cycle's object.
pub async fn put<T>(store: &dyn ResourceStore<T>, retry: &RetryConfig, mut obj: T) -> StoreResult<T>
where
    T: Resource,
{
    let mut attempt = 0u32;
    loop {
        let result = match store.get(&obj.resource_id()).await? {
            None => store.create(obj.clone()).await,
            Some(existing) => {
                obj.meta_mut().version = existing.meta().version;
                store.update(obj.clone()).await
            }
        };

        match result {
            Ok(written) => return Ok(written),
            Err(err) if err.is_transient() && attempt < retry.max_retries => {
                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Removes an object regardless of current version, tolerating absence.
pub async fn purge<T>(
    store: &dyn ResourceStore<T>,
    retry: &RetryConfig,
    id: &T::Id,
) -> StoreResult<()>
where
    T: Resource,
{
    let mut attempt = 0u32;
    loop {
        let Some(obj) = store.get(id).await? else {
            return Ok(());
        };

        match store.delete(id, obj.meta().version).await {
            Ok(()) => return Ok(()),
            Err(StoreError::NotFound { .. }) => return Ok(()),
            Err(err) if err.is_transient() && attempt < retry.max_retries => {
                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
