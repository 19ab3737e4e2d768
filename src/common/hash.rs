//! Hashing utilities for ringkv
//!
//! - BLAKE3 to derive the 64-bit partition hash of a key
//! - Jump consistent hash to map a partition hash onto `n` shards

/// Compute the partition hash of a key.
///
/// The first 8 bytes of BLAKE3(key), little-endian. Every replica of a key
/// must agree on this value, it is stored alongside the value and carried
/// in binlog entries so shards can be filtered without rehashing.
pub fn partition_hash(key: &[u8]) -> u64 {
    let hash = blake3::hash(key);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(buf)
}

/// Jump consistent hash (Lamping & Veach).
///
/// Maps `key` to a bucket in `[0, buckets)`. Growing `buckets` from n to n+1
/// moves only ~1/(n+1) of the keys, all of them into the new bucket.
/// Returns 0 when `buckets` is 0.
pub fn jump_hash(mut key: u64, buckets: u32) -> u32 {
    if buckets == 0 {
        return 0;
    }

    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1i64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as u32
}

/// Shard owning `key` in a ring of `cluster_size` shards
pub fn shard_for_key(key: &[u8], cluster_size: u32) -> u32 {
    jump_hash(partition_hash(key), cluster_size)
}
