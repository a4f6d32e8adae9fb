//! In-process backend bounded by a total memory budget, admission and
//! eviction handled by a TinyLFU-style cost cache.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kvindex_common::model::{BlockKey, PodEntry};
use kvindex_common::Result;
use moka::sync::Cache;

use crate::{filter_allowed, require_nonempty_entries, require_nonempty_keys, IndexBackend};

type PodSet = Arc<Mutex<HashSet<PodEntry>>>;

fn entry_cost(entry: &PodEntry) -> usize {
    entry.pod_identifier.len() + entry.device_tier.len() + 32
}

pub struct CostAwareBackend {
    cache: Cache<BlockKey, PodSet>,
}

impl CostAwareBackend {
    pub fn new(max_bytes: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|_key: &BlockKey, value: &PodSet| -> u32 {
                let set = value.lock().unwrap();
                let bytes: usize = set.iter().map(entry_cost).sum();
                bytes.min(u32::MAX as usize) as u32
            })
            .build();
        Self { cache }
    }

    pub fn approx_weighted_size(&self) -> u64 {
        self.cache.weighted_size()
    }
}

#[async_trait]
impl IndexBackend for CostAwareBackend {
    async fn add(&self, keys: &[BlockKey], entries: &[PodEntry]) -> Result<()> {
        require_nonempty_keys(keys)?;
        require_nonempty_entries(entries)?;
        for key in keys {
            let set = self
                .cache
                .get_with(key.clone(), || Arc::new(Mutex::new(HashSet::new())));
            {
                let mut guard = set.lock().unwrap();
                for entry in entries {
                    guard.insert(entry.clone());
                }
            }
            // Re-insert so the weigher re-reads the now-larger set; moka's
            // TinyLFU admission/eviction runs on every insert, not just the
            // first, so growth is reflected in the cost bound immediately.
            self.cache.insert(key.clone(), set);
        }
        Ok(())
    }

    async fn evict(&self, key: &BlockKey, entries: &[PodEntry]) -> Result<()> {
        require_nonempty_entries(entries)?;
        let Some(set) = self.cache.get(key) else {
            return Ok(());
        };
        let now_empty = {
            let mut guard = set.lock().unwrap();
            for entry in entries {
                guard.remove(entry);
            }
            guard.is_empty()
        };
        if now_empty {
            self.cache.invalidate(key);
        } else {
            self.cache.insert(key.clone(), set);
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
            let Some(set) = self.cache.get(key) else {
                break;
            };
            let pods: Vec<String> = {
                let guard = set.lock().unwrap();
                if guard.is_empty() {
                    break;
                }
                guard.iter().map(|e| e.pod_identifier.clone()).collect()
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
        let backend = CostAwareBackend::new(1024 * 1024);
        backend.add(&[key(1)], &[pod("p1")]).await.unwrap();
        let result = backend.lookup(&[key(1)], &[]).await.unwrap();
        assert_eq!(result[0].1, vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn evict_drops_empty_key() {
        let backend = CostAwareBackend::new(1024 * 1024);
        backend.add(&[key(1)], &[pod("p1")]).await.unwrap();
        backend.evict(&key(1), &[pod("p1")]).await.unwrap();
        let result = backend.lookup(&[key(1)], &[]).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn tiny_budget_eventually_evicts() {
        let backend = CostAwareBackend::new(256);
        for i in 0..500u64 {
            backend.add(&[key(i)], &[pod("p1")]).await.unwrap();
        }
        backend.cache.run_pending_tasks();
        assert!(backend.approx_weighted_size() <= 512);
    }
}
