//! Fragment hashing (§4.1 "Hashing"): a stable, 40-character lowercase hex
//! SHA-1 digest of a fragment's canonical text. Same canonical text, same
//! hash, on every machine and every run — that stability is what lets the
//! cache and the queue agree on a fragment's identity without a shared
//! sequence or database round trip.

use partitioncache_core::FragmentHash;
use sha1::{Digest, Sha1};

/// Hashes `canonical_sql` into a [`FragmentHash`].
pub fn hash_fragment(canonical_sql: &str) -> FragmentHash {
    let mut hasher = Sha1::new();
    hasher.update(canonical_sql.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    FragmentHash::from_hex(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_forty_hex_chars() {
        let h = hash_fragment("select * from t1 where t1.a = 1");
        assert_eq!(h.as_str().len(), 40);
        assert!(h.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identical_text_hashes_identically() {
        let a = hash_fragment("select * from t1 where t1.a = 1");
        let b = hash_fragment("select * from t1 where t1.a = 1");
        assert_eq!(a, b);
    }

    #[test]
    fn different_text_hashes_differently() {
        let a = hash_fragment("select * from t1 where t1.a = 1");
        let b = hash_fragment("select * from t1 where t1.a = 2");
        assert_ne!(a, b);
    }
}
