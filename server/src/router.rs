//! Key-to-shard routing.
//!
//! The placement hash is pinned: clients that preshard their keyspace rely
//! on every server version and every thread computing the same shard for
//! the same key. Do not change the hash or the seed.

/// Seed for the routing hash.
const ROUTING_SEED: u32 = 1;

/// Route a key to a shard.
///
/// With a single shard this short-circuits to 0 without hashing.
pub fn target_shard(key: &[u8], nr_shards: usize) -> usize {
    if nr_shards <= 1 {
        return 0;
    }
    murmur3_32(key, ROUTING_SEED) as usize % nr_shards
}

/// MurmurHash3, x86 32-bit variant.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k |= u32::from(b) << (8 * i);
        }
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
