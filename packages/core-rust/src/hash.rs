//! Content hashing for node identity.
//!
//! A node is identified by the SHA-256 of its canonical raw outbound options.
//! Canonicalization re-encodes the options through `serde_json::Value`, whose
//! object representation sorts keys, so formatting and key-order differences
//! in a subscription source do not change node identity.

use sha2::{Digest, Sha256};

/// Lowercase-hex SHA-256 of the canonical raw options.
#[must_use]
pub fn node_hash(raw_options: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_options);
    hex::encode(hasher.finalize())
}

/// Canonical encoding of an outbound spec: compact JSON with sorted object
/// keys.
///
/// # Errors
///
/// Returns an error only if the value contains a map key that cannot be
/// serialized, which cannot happen for values produced by `serde_json`
/// parsing.
pub fn canonical_options(value: &serde_json::Value) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_lowercase_hex_sha256() {
        let h = node_hash(b"hello");
        assert_eq!(h.len(), 64);
        assert_eq!(
            h,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn key_order_does_not_change_identity() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"type":"socks","server":"a.example","port":1080}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"port":1080,"server":"a.example","type":"socks"}"#).unwrap();

        let ca = canonical_options(&a).unwrap();
        let cb = canonical_options(&b).unwrap();
        assert_eq!(ca, cb);
        assert_eq!(node_hash(&ca), node_hash(&cb));
    }

    #[test]
    fn different_options_differ() {
        let a: serde_json::Value = serde_json::json!({"server": "a.example"});
        let b: serde_json::Value = serde_json::json!({"server": "b.example"});
        assert_ne!(
            node_hash(&canonical_options(&a).unwrap()),
            node_hash(&canonical_options(&b).unwrap())
        );
    }
}
