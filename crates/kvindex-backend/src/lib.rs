//! The block index: a thread-safe, bounded-size mapping `Key ->
//! Set<PodEntry>` behind a pluggable [`IndexBackend`] trait, so the
//! in-memory, cost-aware, and external-store implementations are
//! interchangeable behind one interface.

use async_trait::async_trait;
use kvindex_common::model::{BlockKey, PodEntry};
use kvindex_common::{IndexerError, Result};

pub mod bounded_lru;
pub mod instrumented;

#[cfg(feature = "cost-aware")]
pub mod cost_aware;

/// Capability set {Add, Evict, Lookup} every backend variant implements
/// (bounded LRU, cost-aware memory, external KV, instrumented wrapper).
///
/// The trait is `async` (not merely sync-behind-a-mutex) because the
/// external KV variant does a real network round-trip; the in-process
/// variants simply resolve immediately.
///
/// All operations must be safe under concurrent call. Lookups are
/// advisory and eventually consistent, and eviction must never wedge or
/// block writers.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Adds `entries` to every key in `keys`' pod set.
    async fn add(&self, keys: &[BlockKey], entries: &[PodEntry]) -> Result<()>;

    /// Removes `entries` from `key`'s pod set. A key left with an empty pod
    /// set may be dropped entirely from the index.
    async fn evict(&self, key: &BlockKey, entries: &[PodEntry]) -> Result<()>;

    /// Looks up `keys` in order, stopping at (and including) the first key
    /// with an empty pod set — the longest *contiguous* prefix of hits.
    /// Results are filtered to `allowed_pods` when non-empty.
    async fn lookup(
        &self,
        keys: &[BlockKey],
        allowed_pods: &[String],
    ) -> Result<Vec<(BlockKey, Vec<String>)>>;
}

#[async_trait]
impl IndexBackend for std::sync::Arc<dyn IndexBackend> {
    async fn add(&self, keys: &[BlockKey], entries: &[PodEntry]) -> Result<()> {
        (**self).add(keys, entries).await
    }

    async fn evict(&self, key: &BlockKey, entries: &[PodEntry]) -> Result<()> {
        (**self).evict(key, entries).await
    }

    async fn lookup(
        &self,
        keys: &[BlockKey],
        allowed_pods: &[String],
    ) -> Result<Vec<(BlockKey, Vec<String>)>> {
        (**self).lookup(keys, allowed_pods).await
    }
}

pub(crate) fn require_nonempty_keys(keys: &[BlockKey]) -> Result<()> {
    if keys.is_empty() {
        return Err(IndexerError::UserMisuse("Lookup requires at least one key".into()));
    }
    Ok(())
}

pub(crate) fn require_nonempty_entries(entries: &[PodEntry]) -> Result<()> {
    if entries.is_empty() {
        return Err(IndexerError::UserMisuse(
            "Add/Evict requires at least one pod entry".into(),
        ));
    }
    Ok(())
}

pub(crate) fn filter_allowed(pods: Vec<String>, allowed_pods: &[String]) -> Vec<String> {
    if allowed_pods.is_empty() {
        return pods;
    }
    pods.into_iter()
        .filter(|p| allowed_pods.contains(p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_rejects_empty_keys() {
        assert!(require_nonempty_keys(&[]).is_err());
    }

    #[test]
    fn add_rejects_empty_entries() {
        assert!(require_nonempty_entries(&[]).is_err());
    }

    #[test]
    fn filter_allowed_passes_through_when_empty() {
        let pods = vec!["a".to_string(), "b".to_string()];
        assert_eq!(filter_allowed(pods.clone(), &[]), pods);
    }

    #[test]
    fn filter_allowed_restricts_to_set() {
        let pods = vec!["a".to_string(), "b".to_string()];
        let allowed = vec!["b".to_string()];
        assert_eq!(filter_allowed(pods, &allowed), vec!["b".to_string()]);
    }
}
