//! In-process backend bounded by key count, with a per-key pod LRU bounded
//! by `pod_cache_size`.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kvindex_common::model::{BlockKey, PodEntry};
use kvindex_common::Result;
use lru::LruCache;

use crate::{filter_allowed, require_nonempty_entries, require_nonempty_keys, IndexBackend};

type PodSet = LruCache<PodEntry, ()>;

/// Key-count-bounded LRU of `BlockKey -> pod set`, with a single lock
/// guarding key admission/eviction and a per-key lock guarding pod-set
/// mutation.
pub struct BoundedLruBackend {
    pod_cache_size: NonZeroUsize,
    inner: Mutex<LruCache<BlockKey, Arc<Mutex<PodSet>>>>,
}

impl BoundedLruBackend {
    pub fn new(size: usize, pod_cache_size: usize) -> Self {
        let size = NonZeroUsize::new(size).unwrap_or(NonZeroUsize::new(1).unwrap());
        let pod_cache_size = NonZeroUsize::new(pod_cache_size).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            pod_cache_size,
            inner: Mutex::new(LruCache::new(size)),
        }
    }

    /// Double-checked get-or-create: try a plain get under the outer lock;
    /// on miss, build a fresh per-key pod set and race to install it,
    /// taking whichever slot won.
    fn get_or_create(&self, key: &BlockKey) -> Arc<Mutex<PodSet>> {
        {
            let mut outer = self.inner.lock().unwrap();
            if let Some(existing) = outer.get(key) {
                return existing.clone();
            }
        }
        let candidate = Arc::new(Mutex::new(LruCache::new(self.pod_cache_size)));
        let mut outer = self.inner.lock().unwrap();
        if let Some(existing) = outer.get(key) {
            return existing.clone();
        }
        outer.put(key.clone(), candidate.clone());
        candidate
    }

    fn get_existing(&self, key: &BlockKey) -> Option<Arc<Mutex<PodSet>>> {
        let mut outer = self.inner.lock().unwrap();
        outer.get(key).cloned()
    }

    pub fn key_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn pod_count(&self, key: &BlockKey) -> usize {
        self.get_existing(key)
            .map(|set| set.lock().unwrap().len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl IndexBackend for BoundedLruBackend {
    async fn add(&self, keys: &[BlockKey], entries: &[PodEntry]) -> Result<()> {
        require_nonempty_keys(keys)?;
        require_nonempty_entries(entries)?;
        for key in keys {
            let set = self.get_or_create(key);
            let mut set = set.lock().unwrap();
            for entry in entries {
                set.put(entry.clone(), ());
            }
        }
        Ok(())
    }

    async fn evict(&self, key: &BlockKey, entries: &[PodEntry]) -> Result<()> {
        require_nonempty_entries(entries)?;
        let Some(set) = self.get_existing(key) else {
            return Ok(());
        };
        let now_empty = {
            let mut set = set.lock().unwrap();
            for entry in entries {
                set.pop(entry);
            }
            set.is_empty()
        };
        if now_empty {
            // Best-effort reclamation, not a correctness requirement: eviction
            // must never block writers.
            let mut outer = self.inner.lock().unwrap();
            outer.pop(key);
        }
        Ok(())
    }

    async fn lookup(
        &self,
        keys: &[BlockKey],
        allowed_pods: &[String],
    ) -> Result<Vec<(BlockKey, Vec<String>)>> {
        require_nonempty_keys(keys)?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(set) = self.get_existing(key) else {
                break;
            };
            let pods: Vec<String> = {
                let set = set.lock().unwrap();
                if set.is_empty() {
                    break;
                }
                set.iter().map(|(e, _)| e.pod_identifier.clone()).collect()
            };
            out.push((key.clone(), filter_allowed(pods, allowed_pods)));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(h: u64) -> BlockKey {
        BlockKey::new("m", h)
    }

    fn pod(id: &str) -> PodEntry {
        PodEntry::new(id, "gpu")
    }

    #[tokio::test]
    async fn add_then_lookup_round_trips() {
        let backend = BoundedLruBackend::new(100, 10);
        backend.add(&[key(1)], &[pod("p1")]).await.unwrap();
        let result = backend.lookup(&[key(1)], &[]).await.unwrap();
        assert_eq!(result, vec![(key(1), vec!["p1".to_string()])]);
    }

    #[tokio::test]
    async fn lookup_stops_at_first_miss() {
        let backend = BoundedLruBackend::new(100, 10);
        backend.add(&[key(1)], &[pod("p1")]).await.unwrap();
        let result = backend
            .lookup(&[key(1), key(2), key(3)], &[])
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].0, key(1));
    }

    #[tokio::test]
    async fn evict_removes_entry_and_drops_empty_key() {
        let backend = BoundedLruBackend::new(100, 10);
        backend.add(&[key(1)], &[pod("p1")]).await.unwrap();
        backend.evict(&key(1), &[pod("p1")]).await.unwrap();
        assert_eq!(backend.key_count(), 0);
        let result = backend.lookup(&[key(1)], &[]).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn lookup_filters_by_allowed_pods() {
        let backend = BoundedLruBackend::new(100, 10);
        backend
            .add(&[key(1)], &[pod("p1"), pod("p2")])
            .await
            .unwrap();
        let result = backend
            .lookup(&[key(1)], &["p2".to_string()])
            .await
            .unwrap();
        assert_eq!(result[0].1, vec!["p2".to_string()]);
    }

    #[tokio::test]
    async fn key_count_is_bounded() {
        let backend = BoundedLruBackend::new(2, 10);
        backend.add(&[key(1)], &[pod("p1")]).await.unwrap();
        backend.add(&[key(2)], &[pod("p1")]).await.unwrap();
        backend.add(&[key(3)], &[pod("p1")]).await.unwrap();
        assert!(backend.key_count() <= 2);
    }

    #[tokio::test]
    async fn pod_count_is_bounded() {
        let backend = BoundedLruBackend::new(100, 2);
        backend
            .add(&[key(1)], &[pod("p1"), pod("p2"), pod("p3")])
            .await
            .unwrap();
        assert!(backend.pod_count(&key(1)) <= 2);
    }
}
