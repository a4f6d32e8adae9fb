//! The library surface: constructs an [`Indexer`] from config and wires
//! together the prefix store, tokenizer pool, block index, and scoring
//! composer behind a single `score` entry point.

use std::collections::HashMap;
use std::sync::Arc;

use kvindex_backend::bounded_lru::BoundedLruBackend;
use kvindex_backend::instrumented::InstrumentedBackend;
use kvindex_backend::IndexBackend;
use kvindex_common::config::IndexerConfig;
use kvindex_common::{IndexerError, Result};
use tokio_util::sync::CancellationToken;

use crate::prefix_store::PrefixStore;
use crate::scoring::ScoringComposer;
use crate::tokenizer::{DeterministicLoader, TokenizerCache, TokenizerLoader};
use crate::tokenizer_pool::TokenizerPool;

fn build_block_index(config: &IndexerConfig) -> Result<Arc<dyn IndexBackend>> {
    let block_cfg = &config.kv_block_index_config;
    let backend: Arc<dyn IndexBackend> = if let Some(in_memory) = &block_cfg.in_memory_config {
        Arc::new(BoundedLruBackend::new(in_memory.size, in_memory.pod_cache_size))
    } else if let Some(cost_aware) = &block_cfg.cost_aware_memory_config {
        let bytes = IndexerConfig::cost_aware_size_bytes(cost_aware)?;
        Arc::new(kvindex_backend::cost_aware::CostAwareBackend::new(bytes))
    } else if block_cfg.redis_config.is_some() {
        return Err(IndexerError::ConfigInvalid(
            "redis backend selection requires constructing kvindex-backend-redis::RedisBackend \
             directly and passing it to Indexer::with_block_index"
                .into(),
        ));
    } else {
        return Err(IndexerError::ConfigInvalid(
            "kvBlockIndexConfig must select exactly one backend".into(),
        ));
    };

    if block_cfg.enable_metrics {
        Ok(Arc::new(InstrumentedBackend::new(backend)))
    } else {
        Ok(backend)
    }
}

/// The assembled indexer: prefix store, tokenizer pool, and the block
/// index they share with the event-ingestion pool.
pub struct Indexer {
    config: IndexerConfig,
    prefix_store: Arc<PrefixStore>,
    tokenizer_pool: Arc<TokenizerPool>,
    block_index: Arc<dyn IndexBackend>,
    composer: ScoringComposer,
}

impl Indexer {
    pub fn new(config: IndexerConfig) -> Result<Self> {
        Self::with_loader(config, Arc::new(DeterministicLoader))
    }

    pub fn with_loader(config: IndexerConfig, loader: Arc<dyn TokenizerLoader>) -> Result<Self> {
        let prefix_store = Arc::new(PrefixStore::new(config.prefix_store_config.clone()));
        let tokenizer_cache = Arc::new(TokenizerCache::new(loader));
        let tokenizer_pool = Arc::new(TokenizerPool::new(
            config.tokenizers_pool_config.clone(),
            prefix_store.clone(),
            tokenizer_cache,
        ));
        let block_index = build_block_index(&config)?;
        let composer = ScoringComposer::new(
            tokenizer_pool.clone(),
            prefix_store.clone(),
            block_index.clone(),
            config.token_processor_config.clone(),
        );
        Ok(Self {
            config,
            prefix_store,
            tokenizer_pool,
            block_index,
            composer,
        })
    }

    /// Constructs an indexer around an already-built block index (used to
    /// plug in `kvindex-backend-redis::RedisBackend`, which needs an
    /// async connect step this constructor can't perform).
    pub fn with_block_index(
        config: IndexerConfig,
        loader: Arc<dyn TokenizerLoader>,
        block_index: Arc<dyn IndexBackend>,
    ) -> Self {
        let prefix_store = Arc::new(PrefixStore::new(config.prefix_store_config.clone()));
        let tokenizer_cache = Arc::new(TokenizerCache::new(loader));
        let tokenizer_pool = Arc::new(TokenizerPool::new(
            config.tokenizers_pool_config.clone(),
            prefix_store.clone(),
            tokenizer_cache,
        ));
        let composer = ScoringComposer::new(
            tokenizer_pool.clone(),
            prefix_store.clone(),
            block_index.clone(),
            config.token_processor_config.clone(),
        );
        Self {
            config,
            prefix_store,
            tokenizer_pool,
            block_index,
            composer,
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn block_index(&self) -> Arc<dyn IndexBackend> {
        self.block_index.clone()
    }

    pub fn prefix_store(&self) -> Arc<PrefixStore> {
        self.prefix_store.clone()
    }

    pub fn tokenizer_pool(&self) -> Arc<TokenizerPool> {
        self.tokenizer_pool.clone()
    }

    /// Starts the tokenizer worker pool; returns once `cancel` fires and
    /// every in-flight task has finished.
    pub async fn run(&self, cancel: CancellationToken) {
        self.tokenizer_pool.run(cancel).await;
    }

    pub async fn score(
        &self,
        prompt: &str,
        model: &str,
        allowed_pods: &[String],
    ) -> Result<HashMap<String, i64>> {
        self.composer.score(prompt, model, allowed_pods).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_running(indexer: Arc<Indexer>) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let indexer = indexer.clone();
            let cancel = cancel.clone();
            async move { indexer.run(cancel).await }
        });
        (cancel, handle)
    }

    #[tokio::test]
    async fn score_on_empty_index_is_empty() {
        let indexer = Arc::new(Indexer::new(IndexerConfig::default()).unwrap());
        let (cancel, handle) = spawn_running(indexer.clone());
        let scores = indexer.score("hello world", "m", &[]).await.unwrap();
        assert!(scores.is_empty());
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn score_after_add_returns_pods() {
        let indexer = Arc::new(Indexer::new(IndexerConfig::default()).unwrap());
        let (cancel, handle) = spawn_running(indexer.clone());
        let tokens = indexer.tokenizer_pool().tokenize("hello world", "m").await;
        assert!(!tokens.is_empty());
        let keys = crate::hasher::tokens_to_block_keys(
            &tokens,
            "m",
            &indexer.config().token_processor_config,
        );
        if let Some(key) = keys.first() {
            indexer
                .block_index()
                .add(
                    &[key.clone()],
                    &[kvindex_common::model::PodEntry::new("p1", "gpu")],
                )
                .await
                .unwrap();
            let scores = indexer.score("hello world", "m", &[]).await.unwrap();
            assert_eq!(scores.get("p1"), Some(&1));
        }
        cancel.cancel();
        handle.await.unwrap();
    }
}
