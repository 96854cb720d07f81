//! Cluster hash slot calculation.
//!
//! Keys map to one of 16384 slots by CRC16 (XMODEM) of the key, or of its
//! hash tag when it has one.

use crc::{Crc, CRC_16_XMODEM};

/// Number of hash slots in a cluster.
pub const SLOT_COUNT: u16 = 16384;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the cluster slot for a given key.
///
/// If the key contains `{...}` with at least one byte between the first
/// `{` and the next `}`, only those bytes are hashed.
///
/// # Examples
///
/// ```
/// use slotmux::key_slot;
///
/// assert_eq!(key_slot("foo"), 12182);
/// assert_eq!(key_slot("{user1000}.following"), key_slot("{user1000}.followers"));
/// ```
pub fn key_slot(key: impl AsRef<[u8]>) -> u16 {
    let hashed = hash_tag(key.as_ref());
    CRC16.checksum(hashed) & (SLOT_COUNT - 1)
}

/// Returns the bytes that decide a key's slot.
///
/// - `{user1000}.following` hashes `user1000`
/// - `foo{}{bar}` hashes the whole key, the first tag is empty
/// - `foo{{bar}}` hashes `{bar`
fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_count() {
        assert_eq!(SLOT_COUNT, 16384);
    }

    #[test]
    fn test_known_slots() {
        // Values reported by CLUSTER KEYSLOT.
        assert_eq!(key_slot("foo"), 12182);
        assert_eq!(key_slot("bar"), 5061);
        assert_eq!(key_slot("key1"), 9189);
        assert_eq!(key_slot("key2"), 4998);
        assert_eq!(key_slot("key3"), 935);
        assert_eq!(key_slot("123456789"), 0x31C3 & 0x3FFF);
    }

    #[test]
    fn test_empty_key_is_deterministic() {
        assert_eq!(key_slot(""), 0);
        assert_eq!(key_slot(b""), key_slot(""));
    }

    #[test]
    fn test_key_slot_with_hash_tag() {
        let slot = key_slot("{user1000}.following");
        assert_eq!(slot, key_slot("{user1000}.followers"));
        assert_eq!(slot, key_slot("user1000"));
    }

    #[test]
    fn test_hash_tag_rules() {
        assert_eq!(hash_tag(b"foo{bar}"), b"bar");
        assert_eq!(hash_tag(b"prefix{tag}suffix{x}"), b"tag");
        assert_eq!(hash_tag(b"foo{}{bar}"), b"foo{}{bar}");
        assert_eq!(hash_tag(b"foo{{bar}}"), b"{bar");
        assert_eq!(hash_tag(b"foo{bar"), b"foo{bar");
        assert_eq!(hash_tag(b"no_braces"), b"no_braces");
    }

    #[test]
    fn test_binary_keys() {
        let key = [0xffu8, 0x00, b'{', 0x01, b'}'];
        assert_eq!(key_slot(key), key_slot([0x01u8]));
        assert!(key_slot(key) < SLOT_COUNT);
    }
}
