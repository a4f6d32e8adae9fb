//! The tokenizer itself is an external collaborator: an opaque
//! `encode(text, model) -> (token_ids[], byte_offsets[])` function. This
//! module defines that seam plus the single-flight load cache backing the
//! tokenizer pool, so that concurrent first-use requests for the same
//! base model share one in-flight load instead of racing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use kvindex_common::config::TokenizersPoolConfig;
use kvindex_common::{IndexerError, Result};
use tokio::sync::OnceCell;

/// The opaque `encode` boundary: token ids plus their `[start, end)` byte
/// offsets in `prompt`.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, prompt: &str) -> Result<(Vec<u32>, Vec<(usize, usize)>)>;
}

/// Deterministic whitespace tokenizer used where no real tokenizer
/// backend is wired up (tests, local `score` CLI runs without a model
/// server). Each whitespace-delimited word becomes one token id, hashed
/// from its text so the mapping is stable across runs.
pub struct DeterministicTokenizer;

impl Tokenizer for DeterministicTokenizer {
    fn encode(&self, prompt: &str) -> Result<(Vec<u32>, Vec<(usize, usize)>)> {
        let mut tokens = Vec::new();
        let mut offsets = Vec::new();
        let mut idx = 0usize;
        for word in prompt.split_inclusive(char::is_whitespace) {
            let start = idx;
            let end = idx + word.len();
            let trimmed = word.trim_end();
            if !trimmed.is_empty() {
                let mut hasher = DefaultHasher::new();
                trimmed.hash(&mut hasher);
                tokens.push((hasher.finish() & 0xFFFF_FFFF) as u32);
                offsets.push((start, start + trimmed.len()));
            }
            idx = end;
        }
        Ok((tokens, offsets))
    }
}

/// Loads (or constructs) the tokenizer for a model name. Real deployments
/// plug in a loader that fetches a `tokenizers`-crate `Tokenizer` from
/// `tokenizersPoolConfig.tokenizersCacheDir`, falling back to download
/// with `huggingFaceToken`; tests use [`DeterministicTokenizer`].
pub trait TokenizerLoader: Send + Sync {
    fn load(&self, model: &str) -> Result<Arc<dyn Tokenizer>>;
}

pub struct DeterministicLoader;

impl TokenizerLoader for DeterministicLoader {
    fn load(&self, _model: &str) -> Result<Arc<dyn Tokenizer>> {
        Ok(Arc::new(DeterministicTokenizer))
    }
}

/// Wraps a real `tokenizers::Tokenizer`, adapting its `Encoding` into the
/// `(token_ids[], byte_offsets[])` shape [`Tokenizer::encode`] expects.
pub struct HuggingFaceTokenizer(tokenizers::Tokenizer);

impl Tokenizer for HuggingFaceTokenizer {
    fn encode(&self, prompt: &str) -> Result<(Vec<u32>, Vec<(usize, usize)>)> {
        let encoding = self
            .0
            .encode(prompt, false)
            .map_err(|e| IndexerError::DecodeMalformed(format!("tokenizer encode: {e}")))?;
        let ids = encoding.get_ids().to_vec();
        let offsets = encoding.get_offsets().to_vec();
        Ok((ids, offsets))
    }
}

/// Loads a real tokenizer JSON for `model` from `tokenizersCacheDir`
/// (`{cache_dir}/{model}.json`, the `tokenizers::Tokenizer::from_file`
/// path). Falls back to [`DeterministicTokenizer`] when no such file is
/// cached, so local `score` runs and tests work without a model server;
/// `huggingFaceToken` is carried on the config for a future hub-download
/// fallback but isn't used by this loader today.
pub struct HuggingFaceLoader {
    cache_dir: std::path::PathBuf,
}

impl HuggingFaceLoader {
    pub fn new(config: &TokenizersPoolConfig) -> Self {
        Self {
            cache_dir: config.tokenizers_cache_dir.clone(),
        }
    }
}

impl TokenizerLoader for HuggingFaceLoader {
    fn load(&self, model: &str) -> Result<Arc<dyn Tokenizer>> {
        let path = self.cache_dir.join(format!("{model}.json"));
        if !path.exists() {
            return Ok(Arc::new(DeterministicTokenizer));
        }
        let tokenizer = tokenizers::Tokenizer::from_file(&path).map_err(|e| {
            IndexerError::BackendUnavailable(format!("loading tokenizer {model:?} from {path:?}: {e}"))
        })?;
        Ok(Arc::new(HuggingFaceTokenizer(tokenizer)))
    }
}

/// Bounded-by-usage per-model tokenizer cache with single-flight loading:
/// concurrent first-use calls for the same model share one load via a
/// `tokio::sync::OnceCell`, instead of racing N redundant loads.
pub struct TokenizerCache {
    loader: Arc<dyn TokenizerLoader>,
    slots: DashMap<String, Arc<OnceCell<Arc<dyn Tokenizer>>>>,
}

impl TokenizerCache {
    pub fn new(loader: Arc<dyn TokenizerLoader>) -> Self {
        Self {
            loader,
            slots: DashMap::new(),
        }
    }

    pub async fn get(&self, model: &str) -> Result<Arc<dyn Tokenizer>> {
        let slot = self
            .slots
            .entry(model.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let loader = self.loader.clone();
        let model = model.to_string();
        slot.get_or_try_init(|| async move { loader.load(&model) })
            .await
            .map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_tokenizer_is_stable() {
        let t = DeterministicTokenizer;
        let (a, _) = t.encode("hello world").unwrap();
        let (b, _) = t.encode("hello world").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn hugging_face_loader_falls_back_without_cached_file() {
        let loader = HuggingFaceLoader::new(&TokenizersPoolConfig {
            workers_count: 1,
            min_prefix_overlap_ratio: 0.8,
            hugging_face_token: String::new(),
            tokenizers_cache_dir: "/nonexistent/kvindex-tokenizer-cache".into(),
        });
        let tokenizer = loader.load("no-such-model").unwrap();
        let (tokens, _) = tokenizer.encode("hello world").unwrap();
        assert_eq!(tokens.len(), 2);
    }

    #[tokio::test]
    async fn single_flight_loads_once_per_model() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingLoader(Arc<AtomicUsize>);
        impl TokenizerLoader for CountingLoader {
            fn load(&self, _model: &str) -> Result<Arc<dyn Tokenizer>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(DeterministicTokenizer))
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(TokenizerCache::new(Arc::new(CountingLoader(count.clone()))));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get("m").await.unwrap() }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
