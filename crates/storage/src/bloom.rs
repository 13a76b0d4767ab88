//! Bloom filter over SSTable keys.
//!
//! Classic double-hashing bitset: the SHA-1 of the key is split into two
//! 64-bit halves `h1`/`h2` and probe `i` tests bit `(h1 + i*h2) % m`.
//! False positives cost a wasted index probe; false negatives cannot happen.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

const BITS_PER_KEY: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u8>,
    hashes: u32,
}

impl BloomFilter {
    /// Build a filter sized for `keys.len()` entries.
    pub fn build<'a>(keys: impl ExactSizeIterator<Item = &'a str>) -> Self {
        let n = keys.len().max(1);
        let nbits = (n * BITS_PER_KEY).max(64);
        // k = ln2 * bits/key, rounded; 10 bits/key gives k = 7.
        let hashes = ((BITS_PER_KEY as f64) * 0.69) as u32;
        let hashes = hashes.clamp(1, 30);

        let mut filter = Self {
            bits: vec![0u8; nbits.div_ceil(8)],
            hashes,
        };
        for key in keys {
            filter.insert(key);
        }
        filter
    }

    fn insert(&mut self, key: &str) {
        let (h1, h2) = hash_pair(key);
        let nbits = (self.bits.len() * 8) as u64;
        for i in 0..u64::from(self.hashes) {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % nbits;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// True if the key *may* be present.
    pub fn may_contain(&self, key: &str) -> bool {
        let (h1, h2) = hash_pair(key);
        let nbits = (self.bits.len() * 8) as u64;
        for i in 0..u64::from(self.hashes) {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % nbits;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }
}

fn hash_pair(key: &str) -> (u64, u64) {
    let digest = Sha1::digest(key.as_bytes());
    let h1 = u64::from_le_bytes(digest[0..8].try_into().expect("8-byte slice"));
    let h2 = u64::from_le_bytes(digest[8..16].try_into().expect("8-byte slice"));
    (h1, h2 | 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let keys: Vec<String> = (0..500).map(|i| format!("key_{i}")).collect();
        let filter = BloomFilter::build(keys.iter().map(String::as_str));
        for key in &keys {
            assert!(filter.may_contain(key), "false negative for {key}");
        }
    }

    #[test]
    fn test_mostly_rejects_absent_keys() {
        let keys: Vec<String> = (0..500).map(|i| format!("key_{i}")).collect();
        let filter = BloomFilter::build(keys.iter().map(String::as_str));
        let false_positives = (0..1000)
            .filter(|i| filter.may_contain(&format!("absent_{i}")))
            .count();
        // ~1% expected at 10 bits/key; leave generous slack.
        assert!(
            false_positives < 100,
            "too many false positives: {false_positives}"
        );
    }

    #[test]
    fn test_empty_filter() {
        let filter = BloomFilter::build(std::iter::empty::<&str>());
        assert!(!filter.may_contain("anything"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let keys = ["a", "b", "c"];
        let filter = BloomFilter::build(keys.iter().copied());
        let json = serde_json::to_string(&filter).unwrap();
        let back: BloomFilter = serde_json::from_str(&json).unwrap();
        for key in keys {
            assert!(back.may_contain(key));
        }
    }
}
