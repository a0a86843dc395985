//! C1: the published Redis Cluster hash-slot algorithm.

/// Number of hash slots in the cluster keyspace.
pub const SLOT_COUNT: u16 = 16384;

/// Maps a key's bytes to a hash slot in `[0, SLOT_COUNT)`.
///
/// If the key contains a `{` followed later by a non-empty `}`-enclosed
/// substring (a "hash tag"), only that substring is hashed; otherwise the
/// whole key is hashed. `{}` (empty braces) falls back to hashing the
/// entire key.
pub fn key_to_slot(key: &[u8]) -> u16 {
    let hashed = hash_tag(key).unwrap_or(key);
    crc16::State::<crc16::XMODEM>::calculate(hashed) % SLOT_COUNT
}

fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|&b| b == b'{')?;
    let close_offset = key[open + 1..].iter().position(|&b| b == b'}')?;
    if close_offset == 0 {
        return None;
    }
    Some(&key[open + 1..open + 1 + close_offset])
}
