//! Keyed connector registries used by the agent endpoint

use super::StreamConnector;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;

/// At most one live connector per key.
#[derive(Debug)]
pub struct ConnectorRegistry<K, C>
where
    K: Eq + Hash,
{
    connectors: DashMap<K, Arc<C>>,
}

impl<K, C> Default for ConnectorRegistry<K, C>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            connectors: DashMap::new(),
        }
    }
}

impl<K, C> ConnectorRegistry<K, C>
where
    K: Eq + Hash + Clone,
    C: StreamConnector,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the connector for `key`, creating it atomically if absent.
    pub fn get_or_create(&self, key: K, create: impl FnOnce() -> C) -> Arc<C> {
        self.connectors
            .entry(key)
            .or_insert_with(|| Arc::new(create()))
            .value()
            .clone()
    }

    pub fn get(&self, key: &K) -> Option<Arc<C>> {
        self.connectors.get(key).map(|entry| entry.value().clone())
    }

    /// Unregister and stop the connector for `key`.
    pub async fn remove(&self, key: &K) -> bool {
        // the map guard is released before awaiting
        let removed = self.connectors.remove(key);
        match removed {
            Some((_, connector)) => {
                connector.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stop and drop every connector.
    pub async fn clear(&self) {
        let keys: Vec<K> = self.connectors.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.remove(&key).await;
        }
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}
