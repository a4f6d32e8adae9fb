//! Scoring composer: turns a `(prompt, model, allowed_pods)` request into
//! a `pod_id -> score` map, composing the prefix store, the block-key
//! hasher, and the block index behind a pluggable ranking policy.

use std::collections::HashMap;
use std::sync::Arc;

use kvindex_backend::IndexBackend;
use kvindex_common::config::TokenProcessorConfig;
use kvindex_common::Result;

use crate::hasher::tokens_to_block_keys;
use crate::prefix_store::PrefixStore;
use crate::tokenizer_pool::TokenizerPool;

/// A scoring policy turns the ordered, early-terminated lookup result
/// (one `(BlockKey, pods)` pair per contiguous hit) into a score per pod.
pub trait ScoringPolicy: Send + Sync {
    fn score(&self, hits: &[(String, Vec<String>)]) -> HashMap<String, i64>;
}

/// Start active = pods of the first key, score 1 each. Intersect the
/// active set with each subsequent key's pods, awarding +1 to survivors.
/// Pods never in the first key, or dropped out of the intersection along
/// the way, remain in the map at whatever score they stopped earning.
#[derive(Default)]
pub struct LongestPrefix;

impl ScoringPolicy for LongestPrefix {
    fn score(&self, hits: &[(String, Vec<String>)]) -> HashMap<String, i64> {
        let mut scores = HashMap::new();
        for (_, pods) in hits {
            for pod in pods {
                scores.entry(pod.clone()).or_insert(0);
            }
        }
        let Some((_, first)) = hits.first() else {
            return scores;
        };
        let mut active: Vec<String> = first.clone();
        for pod in &active {
            *scores.get_mut(pod).unwrap() += 1;
        }
        for (_, pods) in hits.iter().skip(1) {
            active.retain(|p| pods.contains(p));
            for pod in &active {
                *scores.get_mut(pod).unwrap() += 1;
            }
        }
        scores
    }
}

/// For each key index `i` (1-based), overwrite `score[pod] = i` for
/// every pod in that key — later (deeper) hits dominate.
#[derive(Default)]
pub struct HighestBlockHit;

impl ScoringPolicy for HighestBlockHit {
    fn score(&self, hits: &[(String, Vec<String>)]) -> HashMap<String, i64> {
        let mut scores = HashMap::new();
        for (i, (_, pods)) in hits.iter().enumerate() {
            let rank = (i + 1) as i64;
            for pod in pods {
                scores.insert(pod.clone(), rank);
            }
        }
        scores
    }
}

/// Increments `score[pod]` for every key that contains it.
#[derive(Default)]
pub struct CoverageBased;

impl ScoringPolicy for CoverageBased {
    fn score(&self, hits: &[(String, Vec<String>)]) -> HashMap<String, i64> {
        let mut scores = HashMap::new();
        for (_, pods) in hits {
            for pod in pods {
                *scores.entry(pod.clone()).or_insert(0) += 1;
            }
        }
        scores
    }
}

pub struct ScoringComposer {
    tokenizer_pool: Arc<TokenizerPool>,
    prefix_store: Arc<PrefixStore>,
    block_index: Arc<dyn IndexBackend>,
    token_processor_config: TokenProcessorConfig,
    policy: Arc<dyn ScoringPolicy>,
}

impl ScoringComposer {
    pub fn new(
        tokenizer_pool: Arc<TokenizerPool>,
        prefix_store: Arc<PrefixStore>,
        block_index: Arc<dyn IndexBackend>,
        token_processor_config: TokenProcessorConfig,
    ) -> Self {
        Self {
            tokenizer_pool,
            prefix_store,
            block_index,
            token_processor_config,
            policy: Arc::new(LongestPrefix),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn ScoringPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub async fn score(
        &self,
        prompt: &str,
        model: &str,
        allowed_pods: &[String],
    ) -> Result<HashMap<String, i64>> {
        // Step 1: amortize future calls via a fire-and-forget tokenization.
        self.tokenizer_pool.enqueue(prompt.to_string(), model.to_string());

        // Step 2: longest contained tokens from what's already cached.
        let (tokens, _coverage) = self
            .prefix_store
            .find_longest_contained_tokens(prompt, model);
        if tokens.is_empty() {
            return Ok(HashMap::new());
        }

        // Step 3: tokens -> block keys.
        let keys = tokens_to_block_keys(&tokens, model, &self.token_processor_config);
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        // Step 4: look up in the block index (early-terminates on miss).
        // This is the one direct backend call on the read path, so its
        // errors surface instead of being swallowed like the rest of Score.
        let lookup = self.block_index.lookup(&keys, allowed_pods).await?;
        let hits: Vec<(String, Vec<String>)> = lookup
            .into_iter()
            .map(|(key, pods)| (format!("{}@{}", key.model_name, key.chunk_hash), pods))
            .collect();

        // Step 5: apply the scoring policy.
        Ok(self.policy.score(&hits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(pairs: &[(&str, &[&str])]) -> Vec<(String, Vec<String>)> {
        pairs
            .iter()
            .map(|(k, pods)| {
                (
                    k.to_string(),
                    pods.iter().map(|p| p.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn longest_prefix_intersects_active_set() {
        let h = hits(&[("k0", &["a", "b"]), ("k1", &["a"]), ("k2", &["a", "c"])]);
        let scores = LongestPrefix.score(&h);
        assert_eq!(scores.get("a"), Some(&3));
        assert_eq!(scores.get("b"), Some(&1));
        assert_eq!(scores.get("c"), Some(&0));
    }

    #[test]
    fn longest_prefix_keeps_pods_never_in_first_key_at_zero() {
        let h = hits(&[("k0", &["a"]), ("k1", &["a", "b"])]);
        let scores = LongestPrefix.score(&h);
        assert_eq!(scores.get("a"), Some(&2));
        assert_eq!(scores.get("b"), Some(&0));
    }

    #[test]
    fn highest_block_hit_overwrites_with_rank() {
        let h = hits(&[("k0", &["a"]), ("k1", &["a", "b"])]);
        let scores = HighestBlockHit.score(&h);
        assert_eq!(scores.get("a"), Some(&2));
        assert_eq!(scores.get("b"), Some(&2));
    }

    #[test]
    fn coverage_based_counts_every_hit() {
        let h = hits(&[("k0", &["a"]), ("k1", &["a", "b"]), ("k2", &["a"])]);
        let scores = CoverageBased.score(&h);
        assert_eq!(scores.get("a"), Some(&3));
        assert_eq!(scores.get("b"), Some(&1));
    }

    #[test]
    fn empty_hits_yield_empty_scores() {
        assert!(LongestPrefix.score(&[]).is_empty());
    }
}
