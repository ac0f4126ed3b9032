//! Stable hashing for cache fingerprints and experiment bucket assignment.
//!
//! Both uses require the digest to be identical across process restarts, so
//! everything here is built on SHA-256 rather than the process-seeded std
//! hasher.

use sha2::{Digest, Sha256};

/// Hex digest of the given parts, joined with a `0x1f` unit separator so that
/// `["ab", "c"]` and `["a", "bc"]` hash differently.
pub fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

/// Map the given parts onto a point in `[0, 1)`, derived from the first eight
/// bytes of their SHA-256 digest. Same inputs always land on the same point.
pub fn stable_unit_interval(parts: &[&str]) -> f64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let numerator = u64::from_be_bytes(bytes);
    // Divide by 2^64 so the result stays strictly below 1.0.
    numerator as f64 / (u64::MAX as f64 + 1.0)
}

#[cfg(test)]
mod hashing_tests {
    use super::{sha256_hex, stable_unit_interval};

    #[test]
    fn test_digest_is_stable() {
        let a = sha256_hex(&["cost_analysis", "user-42"]);
        let b = sha256_hex(&["cost_analysis", "user-42"]);
        assert_eq!(a, b);
        assert_eq!(64, a.len());
    }

    #[test]
    fn test_separator_prevents_concatenation_collisions() {
        assert_ne!(sha256_hex(&["ab", "c"]), sha256_hex(&["a", "bc"]));
    }

    #[test]
    fn test_unit_interval_bounds() {
        for i in 0..100 {
            let point = stable_unit_interval(&["test", &i.to_string()]);
            assert!((0.0..1.0).contains(&point), "point {} out of range", point);
        }
    }
}
