//! Tokenizer worker pool: a rate-limited work queue feeding `N` worker
//! loops that tokenize prompts and populate the prefix store, built on
//! the usual mpsc-channel-plus-`tokio::spawn` worker-loop shape.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use governor::{Quota, RateLimiter};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use kvindex_common::config::TokenizersPoolConfig;

use crate::prefix_store::PrefixStore;
use crate::tokenizer::{Tokenizer, TokenizerCache};

const MAX_ATTEMPTS: u32 = 5;

struct Task {
    prompt: String,
    model: String,
    attempt: u32,
    respond: Option<oneshot::Sender<Vec<u32>>>,
}

/// Enqueue-and-forget or enqueue-and-block frontend over the worker pool.
/// Construction is cheap and spawns nothing; call [`TokenizerPool::run`] to
/// start the worker loops.
pub struct TokenizerPool {
    tx: mpsc::Sender<Task>,
    rx: StdMutex<Option<mpsc::Receiver<Task>>>,
    config: TokenizersPoolConfig,
    prefix_store: Arc<PrefixStore>,
    cache: Arc<TokenizerCache>,
}

impl TokenizerPool {
    pub fn new(
        config: TokenizersPoolConfig,
        prefix_store: Arc<PrefixStore>,
        cache: Arc<TokenizerCache>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Task>(4096);
        Self {
            tx,
            rx: StdMutex::new(Some(rx)),
            config,
            prefix_store,
            cache,
        }
    }

    /// Spawns `workersCount` worker loops sharing one queue. Each loop races
    /// the next recv against `cancel`; once cancelled it finishes whatever
    /// task it already pulled off the queue (no forced interruption), then
    /// exits. Returns once every worker has exited.
    pub async fn run(&self, cancel: CancellationToken) {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("TokenizerPool::run called more than once");
        let rx = Arc::new(Mutex::new(rx));
        let quota = Quota::per_second(
            NonZeroU32::new((self.config.workers_count.max(1) as u32).saturating_mul(50).max(1))
                .unwrap(),
        );
        let limiter = Arc::new(RateLimiter::direct(quota));
        let min_ratio = self.config.min_prefix_overlap_ratio;

        let mut handles = Vec::with_capacity(self.config.workers_count.max(1));
        for _ in 0..self.config.workers_count.max(1) {
            let rx = rx.clone();
            let prefix_store = self.prefix_store.clone();
            let cache = self.cache.clone();
            let limiter = limiter.clone();
            let retry_tx = self.tx.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let task = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        task = async { rx.lock().await.recv().await } => task,
                    };
                    let Some(task) = task else { break };
                    limiter.until_ready().await;
                    run_task(task, &prefix_store, &cache, min_ratio, &retry_tx).await;
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Fire-and-forget enqueue; dropped silently if the queue is full.
    pub fn enqueue(&self, prompt: impl Into<String>, model: impl Into<String>) {
        let _ = self.tx.try_send(Task {
            prompt: prompt.into(),
            model: model.into(),
            attempt: 0,
            respond: None,
        });
    }

    /// Enqueues and blocks until the tokenization completes.
    pub async fn tokenize(&self, prompt: impl Into<String>, model: impl Into<String>) -> Vec<u32> {
        let (respond, recv) = oneshot::channel();
        let task = Task {
            prompt: prompt.into(),
            model: model.into(),
            attempt: 0,
            respond: Some(respond),
        };
        if self.tx.send(task).await.is_err() {
            return Vec::new();
        }
        recv.await.unwrap_or_default()
    }
}

async fn run_task(
    task: Task,
    prefix_store: &PrefixStore,
    cache: &TokenizerCache,
    min_ratio: f64,
    retry_tx: &mpsc::Sender<Task>,
) {
    let Task {
        prompt,
        model,
        attempt,
        respond,
    } = task;

    let (existing, coverage) = prefix_store.find_longest_contained_tokens(&prompt, &model);
    if coverage >= min_ratio && !existing.is_empty() {
        if let Some(respond) = respond {
            let _ = respond.send(existing);
        }
        return;
    }

    match tokenize_and_store(&prompt, &model, prefix_store, cache).await {
        Ok(tokens) => {
            if let Some(respond) = respond {
                let _ = respond.send(tokens);
            }
        }
        Err(_) if attempt + 1 < MAX_ATTEMPTS => {
            let backoff = Duration::from_millis(50 * 2u64.pow(attempt));
            let retry_tx = retry_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                let _ = retry_tx
                    .send(Task {
                        prompt,
                        model,
                        attempt: attempt + 1,
                        respond,
                    })
                    .await;
            });
        }
        Err(_) => {
            if let Some(respond) = respond {
                let _ = respond.send(Vec::new());
            }
        }
    }
}

async fn tokenize_and_store(
    prompt: &str,
    model: &str,
    prefix_store: &PrefixStore,
    cache: &TokenizerCache,
) -> kvindex_common::Result<Vec<u32>> {
    let tokenizer: std::sync::Arc<dyn Tokenizer> = cache.get(model).await?;
    let (tokens, offsets) = tokenizer.encode(prompt)?;
    prefix_store.add_tokenization(model, prompt, &tokens, &offsets);
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::DeterministicLoader;
    use kvindex_common::config::PrefixStoreConfig;

    fn pool() -> Arc<TokenizerPool> {
        let prefix_store = Arc::new(PrefixStore::new(PrefixStoreConfig {
            cache_size: 10,
            block_size: 4,
        }));
        let cache = Arc::new(TokenizerCache::new(Arc::new(DeterministicLoader)));
        Arc::new(TokenizerPool::new(
            TokenizersPoolConfig {
                workers_count: 2,
                min_prefix_overlap_ratio: 0.8,
                hugging_face_token: String::new(),
                tokenizers_cache_dir: "./bin".into(),
            },
            prefix_store,
            cache,
        ))
    }

    /// Builds a pool and spawns its worker loops in the background; the
    /// returned token stops them once the test drops it.
    fn running_pool() -> (Arc<TokenizerPool>, CancellationToken) {
        let pool = pool();
        let cancel = CancellationToken::new();
        tokio::spawn({
            let pool = pool.clone();
            let cancel = cancel.clone();
            async move { pool.run(cancel).await }
        });
        (pool, cancel)
    }

    #[tokio::test]
    async fn tokenize_blocks_until_done() {
        let (pool, cancel) = running_pool();
        let tokens = pool.tokenize("hello world", "m").await;
        assert_eq!(tokens.len(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn enqueue_does_not_block() {
        let (pool, cancel) = running_pool();
        pool.enqueue("fire and forget", "m");
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn repeated_tokenize_reuses_prefix_store() {
        let (pool, cancel) = running_pool();
        let first = pool.tokenize("hello world", "m").await;
        let second = pool.tokenize("hello world", "m").await;
        assert_eq!(first, second);
        cancel.cancel();
    }
}
