use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::overlay::OverlayCache;
use crate::worker::CacheAccessWorker;

/// A typed view of one logical cache: reads go through the in-memory overlay and fall back to a
/// blocking worker read; writes update the overlay and are queued for the worker.
pub struct PersistentIndexedCache<V> {
    name: Arc<str>,
    overlay: Arc<OverlayCache<V>>,
    worker: Arc<CacheAccessWorker>,
}

impl<V> Clone for PersistentIndexedCache<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            overlay: self.overlay.clone(),
            worker: self.worker.clone(),
        }
    }
}

impl<V> PersistentIndexedCache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(name: &str, overlay: Arc<OverlayCache<V>>, worker: Arc<CacheAccessWorker>) -> Self {
        Self {
            name: Arc::from(name),
            overlay,
            worker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Result<Option<Arc<V>>> {
        self.overlay.get_or_load(key, || {
            let name = self.name.clone();
            let key = key.to_string();
            self.worker.read(move |session| Ok(session.get::<V>(&name, &key)))
        })
    }

    pub fn put(&self, key: impl Into<String>, value: V) -> Result<()> {
        let key = key.into();
        let value = Arc::new(value);
        self.overlay.insert(key.clone(), value.clone());
        let name = self.name.clone();
        self.worker
            .enqueue(move |session| session.put(&name, &key, value.as_ref()))
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.overlay.insert_absent(key);
        let name = self.name.clone();
        let key = key.to_string();
        self.worker.enqueue(move |session| session.remove(&name, &key))
    }

    pub fn overlay(&self) -> &Arc<OverlayCache<V>> {
        &self.overlay
    }
}
