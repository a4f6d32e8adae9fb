//! Shared error taxonomy and configuration types for the KV-cache indexer.

pub type Result<T> = core::result::Result<T, IndexerError>;

/// Error taxonomy by *kind*: `ConfigInvalid`/`BackendUnavailable` are fatal
/// at construction, `DecodeMalformed`/`CapacityExceeded`/`Transient` are
/// swallowed on the write path, and `UserMisuse` is caller-visible.
#[derive(thiserror::Error, Debug)]
pub enum IndexerError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("malformed payload: {0}")]
    DecodeMalformed(String),
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("invalid call: {0}")]
    UserMisuse(String),
}

pub mod model {
    //! Core data model shared by the block index, hasher, and event pool.

    /// `(model_name, chunk_hash)` — uniquely identifies a cacheable KV block.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct BlockKey {
        pub model_name: String,
        pub chunk_hash: u64,
    }

    impl BlockKey {
        pub fn new(model_name: impl Into<String>, chunk_hash: u64) -> Self {
            Self {
                model_name: model_name.into(),
                chunk_hash,
            }
        }
    }

    /// A serving instance holding a block, tagged with its device tier.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct PodEntry {
        pub pod_identifier: String,
        pub device_tier: String,
    }

    impl PodEntry {
        pub fn new(pod_identifier: impl Into<String>, device_tier: impl Into<String>) -> Self {
            Self {
                pod_identifier: pod_identifier.into(),
                device_tier: device_tier.into(),
            }
        }

        pub const DEFAULT_TIER: &'static str = "gpu";
    }
}

pub mod config {
    use std::env;
    use std::path::PathBuf;
    use std::time::Duration;

    use serde::Deserialize;

    /// Config for the prefix store.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PrefixStoreConfig {
        /// Max LRU entries per model.
        pub cache_size: usize,
        /// Bytes per prefix block.
        pub block_size: usize,
    }

    impl Default for PrefixStoreConfig {
        fn default() -> Self {
            Self {
                cache_size: 500_000,
                block_size: 256,
            }
        }
    }

    /// Config for the block-key hasher.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TokenProcessorConfig {
        /// Tokens per block key.
        pub block_size: usize,
        /// Seed for the initial block-key hash.
        pub hash_seed: String,
    }

    impl Default for TokenProcessorConfig {
        fn default() -> Self {
            Self {
                block_size: 16,
                hash_seed: String::new(),
            }
        }
    }

    /// Bounded-LRU block-index backend knobs.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct InMemoryConfig {
        /// Max keys in the bounded LRU backend.
        pub size: usize,
        /// Max pods tracked per key.
        pub pod_cache_size: usize,
    }

    impl Default for InMemoryConfig {
        fn default() -> Self {
            Self {
                size: 100_000_000,
                pod_cache_size: 10,
            }
        }
    }

    /// Cost-bounded (TinyLFU-style) block-index backend knobs.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CostAwareMemoryConfig {
        /// Human-readable memory bound, e.g. "2GiB".
        pub size: String,
    }

    impl Default for CostAwareMemoryConfig {
        fn default() -> Self {
            Self {
                size: "2GiB".to_string(),
            }
        }
    }

    /// External KV-store (Redis) block-index backend knobs.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct RedisConfig {
        pub address: String,
    }

    impl Default for RedisConfig {
        fn default() -> Self {
            Self {
                address: "redis://127.0.0.1:6379".to_string(),
            }
        }
    }

    /// Block-index backend selection and shared knobs. The first non-null
    /// of `in_memory`, `cost_aware_memory`, `redis` (in that order) wins.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct KvBlockIndexConfig {
        pub in_memory_config: Option<InMemoryConfig>,
        pub cost_aware_memory_config: Option<CostAwareMemoryConfig>,
        pub redis_config: Option<RedisConfig>,
        pub enable_metrics: bool,
        #[serde(with = "duration_secs_opt", default)]
        pub metrics_logging_interval: Option<Duration>,
    }

    impl Default for KvBlockIndexConfig {
        fn default() -> Self {
            Self {
                in_memory_config: Some(InMemoryConfig::default()),
                cost_aware_memory_config: None,
                redis_config: None,
                enable_metrics: false,
                metrics_logging_interval: None,
            }
        }
    }

    mod duration_secs_opt {
        use serde::{Deserialize, Deserializer};
        use std::time::Duration;

        pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let secs: Option<u64> = Option::deserialize(d)?;
            Ok(secs.filter(|s| *s > 0).map(Duration::from_secs))
        }
    }

    /// Tokenizer worker pool knobs.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TokenizersPoolConfig {
        pub workers_count: usize,
        pub min_prefix_overlap_ratio: f64,
        pub hugging_face_token: String,
        pub tokenizers_cache_dir: PathBuf,
    }

    impl Default for TokenizersPoolConfig {
        fn default() -> Self {
            Self {
                workers_count: 5,
                min_prefix_overlap_ratio: 0.8,
                hugging_face_token: String::new(),
                tokenizers_cache_dir: PathBuf::from("./bin"),
            }
        }
    }

    /// Event-ingestion pool knobs.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct EventPoolConfig {
        pub zmq_endpoint: String,
        pub topic_filter: String,
        pub concurrency: usize,
    }

    impl Default for EventPoolConfig {
        fn default() -> Self {
            Self {
                zmq_endpoint: "tcp://*:5557".to_string(),
                topic_filter: "kv@".to_string(),
                concurrency: 4,
            }
        }
    }

    /// Top-level indexer configuration, assembled from the sections above.
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct IndexerConfig {
        #[serde(default)]
        pub prefix_store_config: PrefixStoreConfig,
        #[serde(default)]
        pub token_processor_config: TokenProcessorConfig,
        #[serde(default)]
        pub kv_block_index_config: KvBlockIndexConfig,
        #[serde(default)]
        pub tokenizers_pool_config: TokenizersPoolConfig,
        #[serde(default)]
        pub event_pool: EventPoolConfig,
    }

    impl IndexerConfig {
        /// Loads config from an `INDEXER_CONFIG` path (JSON or YAML, by
        /// extension) if set, else a small set of env-var overrides on top
        /// of defaults.
        pub fn load() -> Self {
            if let Ok(path) = env::var("INDEXER_CONFIG") {
                if let Ok(text) = std::fs::read_to_string(&path) {
                    let parsed = if path.ends_with(".json") {
                        serde_json::from_str::<IndexerConfig>(&text).ok()
                    } else {
                        serde_yaml::from_str::<IndexerConfig>(&text).ok()
                    };
                    if let Some(cfg) = parsed {
                        return cfg;
                    }
                }
            }
            let mut cfg = Self::default();
            if let Ok(v) = env::var("INDEXER_ZMQ_ENDPOINT") {
                cfg.event_pool.zmq_endpoint = v;
            }
            if let Ok(v) = env::var("INDEXER_TOPIC_FILTER") {
                cfg.event_pool.topic_filter = v;
            }
            if let Some(v) = env::var("INDEXER_EVENT_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
            {
                cfg.event_pool.concurrency = v;
            }
            if let Ok(v) = env::var("INDEXER_REDIS_ADDRESS") {
                cfg.kv_block_index_config.redis_config = Some(RedisConfig { address: v });
                cfg.kv_block_index_config.in_memory_config = None;
            }
            cfg
        }

        /// Parses `costAwareMemoryConfig.size` into a byte count, returning
        /// `ConfigInvalid` for unparsable strings (fatal at construction).
        pub fn cost_aware_size_bytes(cfg: &CostAwareMemoryConfig) -> super::Result<u64> {
            cfg.size
                .parse::<bytesize::ByteSize>()
                .map(|b| b.as_u64())
                .map_err(|e| {
                    super::IndexerError::ConfigInvalid(format!(
                        "costAwareMemoryConfig.size {:?}: {e}",
                        cfg.size
                    ))
                })
        }
    }
}
