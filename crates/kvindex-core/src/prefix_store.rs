//! Token prefix store: a model-scoped cache from a prompt's byte blocks
//! to the tokens they own, enabling partial-prefix reuse without a
//! tokenizer. Blocks are keyed by a rolling hash and held in a per-model
//! bounded LRU guarded by a reader-writer lock.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::RwLock;

use kvindex_common::config::PrefixStoreConfig;
use lru::LruCache;

#[derive(Debug, Clone, Default)]
struct TokenOffset {
    start: usize,
    end: usize,
}

#[derive(Debug, Clone)]
struct OwnedToken {
    id: u32,
    offset: TokenOffset,
}

/// Tokens owned by one byte block, keyed by the block's rolling hash.
type BlockEntry = Vec<OwnedToken>;

struct ModelStore {
    blocks: LruCache<u64, BlockEntry>,
}

impl ModelStore {
    fn new(cache_size: NonZeroUsize) -> Self {
        Self {
            blocks: LruCache::new(cache_size),
        }
    }
}

/// Fast non-cryptographic rolling hash over byte blocks: `h_i =
/// H(h_{i-1} ∥ bytes_i)`, `h_0 = 0`, chained so identical blocks at
/// different prefixes still hash differently.
fn roll(prev: u64, block: &[u8]) -> u64 {
    use std::hash::Hasher;
    let mut hasher = fxhash::FxHasher64::default();
    hasher.write_u64(prev);
    hasher.write(block);
    hasher.finish()
}

pub struct PrefixStore {
    config: PrefixStoreConfig,
    models: RwLock<HashMap<String, ModelStore>>,
}

impl PrefixStore {
    pub fn new(config: PrefixStoreConfig) -> Self {
        Self {
            config,
            models: RwLock::new(HashMap::new()),
        }
    }

    fn block_size(&self) -> usize {
        self.config.block_size.max(1)
    }

    /// Records a full tokenization: `tokens[i]` ends at byte offset
    /// `offsets[i].1`. A token belongs to the block whose byte range
    /// contains its end offset and that isn't already claimed by the
    /// previous block.
    pub fn add_tokenization(
        &self,
        model: &str,
        prompt: &str,
        tokens: &[u32],
        offsets: &[(usize, usize)],
    ) {
        if prompt.is_empty() || tokens.is_empty() {
            return;
        }
        debug_assert_eq!(tokens.len(), offsets.len());

        let block_size = self.block_size();
        let bytes = prompt.as_bytes();
        let num_blocks = bytes.len().div_ceil(block_size);

        let mut per_block: Vec<BlockEntry> = vec![Vec::new(); num_blocks];
        for (&tok, &(start, end)) in tokens.iter().zip(offsets.iter()) {
            let block_idx = (end.saturating_sub(1)) / block_size;
            let block_idx = block_idx.min(num_blocks.saturating_sub(1));
            per_block[block_idx].push(OwnedToken {
                id: tok,
                offset: TokenOffset { start, end },
            });
        }

        let mut h = 0u64;
        let cache_size = NonZeroUsize::new(self.config.cache_size.max(1)).unwrap();
        let mut models = self.models.write().unwrap();
        let store = models
            .entry(model.to_string())
            .or_insert_with(|| ModelStore::new(cache_size));

        for (i, block) in per_block.into_iter().enumerate() {
            let start = i * block_size;
            let end = (start + block_size).min(bytes.len());
            h = roll(h, &bytes[start..end]);
            // Store every traversed block, even an empty one (a straddling
            // token owned by a later block leaves this one with no tokens
            // of its own): a missing entry means "never added", not "added
            // but empty", so `find_longest_contained_tokens` can still walk
            // past it instead of treating it as a miss.
            store.blocks.put(h, block);
        }
    }

    /// Walks the prompt's byte blocks left to right; on the first miss,
    /// stops and returns the accumulated tokens and byte coverage ratio.
    pub fn find_longest_contained_tokens(&self, prompt: &str, model: &str) -> (Vec<u32>, f64) {
        if prompt.is_empty() {
            return (Vec::new(), 0.0);
        }
        let block_size = self.block_size();
        let bytes = prompt.as_bytes();
        let num_blocks = bytes.len().div_ceil(block_size);

        let mut models = self.models.write().unwrap();
        let Some(store) = models.get_mut(model) else {
            return (Vec::new(), 0.0);
        };

        let mut h = 0u64;
        let mut tokens = Vec::new();
        let mut matched_bytes = 0usize;
        for i in 0..num_blocks {
            let start = i * block_size;
            let end = (start + block_size).min(bytes.len());
            h = roll(h, &bytes[start..end]);
            let Some(owned) = store.blocks.get(&h) else {
                break;
            };
            for t in owned {
                tokens.push(t.id);
            }
            matched_bytes = end;
        }
        let coverage = matched_bytes as f64 / bytes.len() as f64;
        (tokens, coverage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PrefixStore {
        PrefixStore::new(PrefixStoreConfig {
            cache_size: 10,
            block_size: 4,
        })
    }

    #[test]
    fn miss_on_empty_store() {
        let s = store();
        let (tokens, coverage) = s.find_longest_contained_tokens("hello", "m");
        assert!(tokens.is_empty());
        assert_eq!(coverage, 0.0);
    }

    #[test]
    fn exact_prompt_round_trips() {
        let s = store();
        let prompt = "helloworld"; // 10 bytes, block_size=4 -> 3 blocks
        let tokens = vec![1, 2, 3];
        let offsets = vec![(0, 4), (4, 8), (8, 10)];
        s.add_tokenization("m", prompt, &tokens, &offsets);
        let (found, coverage) = s.find_longest_contained_tokens(prompt, "m");
        assert_eq!(found, tokens);
        assert_eq!(coverage, 1.0);
    }

    #[test]
    fn prefix_monotonicity_p2() {
        let s = store();
        let p2 = "helloworld!!";
        let tokens = vec![1, 2, 3, 4];
        let offsets = vec![(0, 4), (4, 8), (8, 10), (10, 12)];
        s.add_tokenization("m", p2, &tokens, &offsets);

        let p1 = "hellow"; // shares the first byte block with p2
        let (found, _) = s.find_longest_contained_tokens(p1, "m");
        assert!(tokens.windows(found.len()).any(|w| w == found.as_slice()) || found.is_empty());
    }

    #[test]
    fn straddling_token_leaves_earlier_block_queryable() {
        let s = store();
        let prompt = "abcdef"; // 6 bytes, block_size=4 -> 2 blocks
        let tokens = vec![1];
        let offsets = vec![(0, 6)]; // end=6 -> owned by block (6-1)/4 = 1
        s.add_tokenization("m", prompt, &tokens, &offsets);

        let (found, coverage) = s.find_longest_contained_tokens(prompt, "m");
        assert_eq!(found, tokens);
        assert_eq!(coverage, 1.0);
    }

    #[test]
    fn unknown_model_is_a_clean_miss() {
        let s = store();
        let (tokens, coverage) = s.find_longest_contained_tokens("abcd", "nope");
        assert!(tokens.is_empty());
        assert_eq!(coverage, 0.0);
    }

    #[test]
    fn empty_prompt_is_a_no_op() {
        let s = store();
        s.add_tokenization("m", "", &[], &[]);
        let (tokens, coverage) = s.find_longest_contained_tokens("", "m");
        assert!(tokens.is_empty());
        assert_eq!(coverage, 0.0);
    }
}
