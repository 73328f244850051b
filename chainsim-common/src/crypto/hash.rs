use sha2::{Digest, Sha256};

/// Computes the SHA-256 digest of the given data and returns it as a hex string.
pub fn digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Maps `seed` deterministically into `[0, modulo)`.
///
/// Uses the first eight bytes of the SHA-256 digest as a big-endian integer.
/// Returns 0 when `modulo` is 0.
pub fn hash_to_range(seed: &[u8], modulo: u64) -> u64 {
    if modulo == 0 {
        return 0;
    }
    let out = Sha256::digest(seed);
    let mut head = [0u8; 8];
    head.copy_from_slice(&out[..8]);
    u64::from_be_bytes(head) % modulo
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest() {
        let hash = digest(b"hello world");
        assert_eq!(hash, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
    }

    #[test]
    fn test_hash_to_range_bounds() {
        for slot in 0u64..200 {
            let v = hash_to_range(&slot.to_be_bytes(), 7);
            assert!(v < 7);
        }
        assert_eq!(hash_to_range(b"anything", 0), 0);
    }

    #[test]
    fn test_hash_to_range_deterministic() {
        assert_eq!(hash_to_range(b"slot-42", 1000), hash_to_range(b"slot-42", 1000));
    }
}
