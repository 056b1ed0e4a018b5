//! # Shard Hashing
//!
//! Purpose: Provide the FNV-1a hash and shard-count normalization shared by
//! every sharded structure (data dict, ttl dict, version map, pub/sub hub).
//!
//! ## Design Principles
//! 1. **Deterministic, Unkeyed Hash**: FNV-1a has no per-process seed, so the
//!    same key always maps to the same shard across restarts (important for
//!    AOF replay determinism and cross-peer routing).
//! 2. **Power-of-Two Shard Counts**: Enables masking instead of modulo.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes the 32-bit FNV-1a hash of `data`.
pub fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Rounds `count` up to the next power of two, with a floor of 1.
pub fn normalize_shard_count(count: usize) -> usize {
    count.max(1).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_to_power_of_two() {
        assert_eq!(normalize_shard_count(0), 1);
        assert_eq!(normalize_shard_count(1), 1);
        assert_eq!(normalize_shard_count(5), 8);
        assert_eq!(normalize_shard_count(16), 16);
        assert_eq!(normalize_shard_count(17), 32);
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(fnv1a32(b"alpha"), fnv1a32(b"alpha"));
        assert_ne!(fnv1a32(b"alpha"), fnv1a32(b"beta"));
    }
}
