//! Short-lived cache of container status

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::types::ContainerInfo;

struct Entry {
    info: ContainerInfo,
    refreshed_at: Instant,
}

/// Maps a container identifier to its last known [`ContainerInfo`].
///
/// Entries older than the TTL are never served. The controller overwrites
/// or invalidates an entry on every mutation it performs.
pub struct StatusCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh entry for `id`, if any
    pub async fn get(&self, id: &str) -> Option<ContainerInfo> {
        let entries = self.entries.read().await;
        entries
            .get(id)
            .filter(|e| e.refreshed_at.elapsed() < self.ttl)
            .map(|e| e.info.clone())
    }

    pub async fn put(&self, info: ContainerInfo) {
        let mut entries = self.entries.write().await;
        entries.insert(
            info.id.clone(),
            Entry {
                info,
                refreshed_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, id: &str) {
        self.entries.write().await.remove(id);
    }

    /// Drop expired entries, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.refreshed_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::types::ContainerState;
    use chrono::Utc;

    fn info(id: &str, state: ContainerState) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            lesson_id: "l1".to_string(),
            container_id: format!("rt-{}", id),
            name: format!("playground-l1-{}", id),
            state,
            image: "alpine:3".to_string(),
            created_at: Utc::now(),
            started_at: None,
            exit_code: None,
            message: None,
            env: Default::default(),
            ports: Default::default(),
            one_shot: false,
        }
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let cache = StatusCache::new(Duration::from_secs(60));
        cache.put(info("a", ContainerState::Starting)).await;
        cache.put(info("a", ContainerState::Running)).await;

        let cached = cache.get("a").await.unwrap();
        assert_eq!(cached.state, ContainerState::Running);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_not_served() {
        let cache = StatusCache::new(Duration::from_millis(20));
        cache.put(info("a", ContainerState::Running)).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(cache.get("a").await.is_none());
        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = StatusCache::new(Duration::from_secs(60));
        cache.put(info("a", ContainerState::Running)).await;
        cache.invalidate("a").await;
        assert!(cache.get("a").await.is_none());
    }
}
