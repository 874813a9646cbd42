//! In-memory resource store.
//!
//! Backs tests and embeddings. Semantics match any conforming backend:
//! optimistic versioning per object, change notifications on a broadcast
//! channel, no cross-object transactions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use super::cluster::Cluster;
use super::{Resource, ResourceStore, StoreError, StoreEvent, StoreResult, WATCH_CHANNEL_CAPACITY};

/// An in-memory, versioned object store for one resource kind.
pub struct MemoryStore<T: Resource> {
    objects: RwLock<HashMap<T::Id, T>>,
    events: broadcast::Sender<StoreEvent<T::Id>>,
}

impl<T: Resource> MemoryStore<T> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        MemoryStore {
            objects: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn notify(&self, event: StoreEvent<T::Id>) {
        // Nobody listening is fine; workers also resync periodically.
        let _ = self.events.send(event);
    }
}

impl<T: Resource> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Resource> ResourceStore<T> for MemoryStore<T> {
    async fn get(&self, id: &T::Id) -> StoreResult<Option<T>> {
        Ok(self.objects.read().await.get(id).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<T>> {
        let mut objects: Vec<T> = self.objects.read().await.values().cloned().collect();
        objects.sort_by(|a, b| a.resource_id().cmp(&b.resource_id()));
        Ok(objects)
    }

    async fn create(&self, mut obj: T) -> StoreResult<T> {
        let id = obj.resource_id();
        let mut objects = self.objects.write().await;
        if objects.contains_key(&id) {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                id: id.to_string(),
            });
        }

        obj.meta_mut().version = 1;
        objects.insert(id.clone(), obj.clone());
        drop(objects);

        self.notify(StoreEvent::Created(id));
        Ok(obj)
    }

    async fn update(&self, mut obj: T) -> StoreResult<T> {
        let id = obj.resource_id();
        let mut objects = self.objects.write().await;
        let stored = objects.get(&id).ok_or_else(|| StoreError::NotFound {
            kind: T::KIND,
            id: id.to_string(),
        })?;

        let expected = obj.meta().version;
        let current = stored.meta().version;
        if expected != current {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                id: id.to_string(),
                expected,
                stored: current,
            });
        }

        obj.meta_mut().version = current + 1;
        objects.insert(id.clone(), obj.clone());
        drop(objects);

        self.notify(StoreEvent::Updated(id));
        Ok(obj)
    }

    async fn delete(&self, id: &T::Id, expected_version: u64) -> StoreResult<()> {
        let mut objects = self.objects.write().await;
        let stored = objects.get(id).ok_or_else(|| StoreError::NotFound {
            kind: T::KIND,
            id: id.to_string(),
        })?;

        let current = stored.meta().version;
        if expected_version != current {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                id: id.to_string(),
                expected: expected_version,
                stored: current,
            });
        }

        objects.remove(id);
        drop(objects);

        self.notify(StoreEvent::Deleted(id.clone()));
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent<T::Id>> {
        self.events.subscribe()
    }
}

impl Cluster {
    /// Builds a cluster backed entirely by in-memory stores.
    pub fn in_memory() -> Self {
        Cluster {
            installations: Arc::new(MemoryStore::new()),
            executions: Arc::new(MemoryStore::new()),
            items: Arc::new(MemoryStore::new()),
            data_objects: Arc::new(MemoryStore::new()),
            targets: Arc::new(MemoryStore::new()),
        }
    }
}
