//! Block-key derivation: a deterministic, content-addressed hash turning
//! a token sequence into `BlockKey`s that must match bit-for-bit what the
//! emitting inference workers compute.

use kvindex_common::config::TokenProcessorConfig;
use kvindex_common::model::BlockKey;
use sha2::{Digest, Sha256};

/// Canonical serialization of the rolling-hash input tuple. The wire
/// contract fixes this shape: a little JSON-like array `[prev_hash,
/// chunk, null]`, encoded as the big-endian bytes SHA-256 is fed.
fn canonical_serialize_chunk(prev_hash: u64, chunk: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + chunk.len() * 4 + 1);
    buf.extend_from_slice(&prev_hash.to_be_bytes());
    for &tok in chunk {
        buf.extend_from_slice(&tok.to_be_bytes());
    }
    buf.push(0); // the reserved "extra" (null) slot
    buf
}

fn canonical_serialize_seed(seed: &str) -> Vec<u8> {
    seed.as_bytes().to_vec()
}

fn last_u64_be(digest: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[digest.len() - 8..]);
    u64::from_be_bytes(bytes)
}

/// Turns `tokens` into an ordered list of `BlockKey`s for `model`,
/// partitioning into non-overlapping runs of exactly `config.block_size`
/// tokens. Any trailing partial run is discarded.
pub fn tokens_to_block_keys(
    tokens: &[u32],
    model: &str,
    config: &TokenProcessorConfig,
) -> Vec<BlockKey> {
    if config.block_size == 0 {
        return Vec::new();
    }
    let mut h = last_u64_be(&Sha256::digest(canonical_serialize_seed(&config.hash_seed)));
    let mut keys = Vec::with_capacity(tokens.len() / config.block_size);
    for chunk in tokens.chunks(config.block_size) {
        if chunk.len() < config.block_size {
            break;
        }
        h = last_u64_be(&Sha256::digest(canonical_serialize_chunk(h, chunk)));
        keys.push(BlockKey::new(model, h));
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TokenProcessorConfig {
        TokenProcessorConfig {
            block_size: 4,
            hash_seed: String::new(),
        }
    }

    #[test]
    fn discards_trailing_partial_run() {
        let tokens = vec![1, 2, 3, 4, 5, 6];
        let keys = tokens_to_block_keys(&tokens, "m", &cfg());
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn deterministic_across_calls() {
        let tokens = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let a = tokens_to_block_keys(&tokens, "m", &cfg());
        let b = tokens_to_block_keys(&tokens, "m", &cfg());
        assert_eq!(a, b);
    }

    #[test]
    fn different_seed_changes_hash() {
        let tokens = vec![1, 2, 3, 4];
        let default_cfg = cfg();
        let seeded_cfg = TokenProcessorConfig {
            hash_seed: "other".to_string(),
            ..default_cfg.clone()
        };
        let a = tokens_to_block_keys(&tokens, "m", &default_cfg);
        let b = tokens_to_block_keys(&tokens, "m", &seeded_cfg);
        assert_ne!(a[0].chunk_hash, b[0].chunk_hash);
    }

    #[test]
    fn chained_hash_differs_between_identical_blocks_in_different_prefixes() {
        let a_tokens = vec![9, 9, 9, 9, 1, 2, 3, 4];
        let b_tokens = vec![1, 2, 3, 4];
        let a = tokens_to_block_keys(&a_tokens, "m", &cfg());
        let b = tokens_to_block_keys(&b_tokens, "m", &cfg());
        assert_ne!(a[1].chunk_hash, b[0].chunk_hash);
    }

    #[test]
    fn empty_tokens_yield_no_keys() {
        assert!(tokens_to_block_keys(&[], "m", &cfg()).is_empty());
    }
}
