//! Propagated-event signing (spec.md §4.10/§6).
//!
//! Produces `"<algorithm>:<hex_digest>"` strings over the canonical tuple
//! `(machine_id, source_node_id, timestamp, satisfaction_level,
//! matched_values)`. HMAC-SHA256 uses a key supplied at configuration time;
//! SHA256/SHA512 are unkeyed digests.

use crate::types::{MatchedValue, SignatureAlgorithm};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;

fn canonical_payload(
    machine_id: &str,
    source_node_id: Option<&str>,
    timestamp: DateTime<Utc>,
    satisfaction_level: f64,
    matched_values: &BTreeMap<String, MatchedValue>,
) -> String {
    let matched_json = serde_json::to_string(matched_values).unwrap_or_default();
    format!(
        "{machine_id}|{}|{}|{satisfaction_level}|{matched_json}",
        source_node_id.unwrap_or(""),
        timestamp.to_rfc3339(),
    )
}

pub fn sign(
    algorithm: SignatureAlgorithm,
    hmac_key: Option<&[u8]>,
    machine_id: &str,
    source_node_id: Option<&str>,
    timestamp: DateTime<Utc>,
    satisfaction_level: f64,
    matched_values: &BTreeMap<String, MatchedValue>,
) -> String {
    let payload = canonical_payload(machine_id, source_node_id, timestamp, satisfaction_level, matched_values);

    match algorithm {
        SignatureAlgorithm::Sha256 => {
            let digest = Sha256::digest(payload.as_bytes());
            format!("SHA256:{}", hex::encode(digest))
        }
        SignatureAlgorithm::Sha512 => {
            let digest = Sha512::digest(payload.as_bytes());
            format!("SHA512:{}", hex::encode(digest))
        }
        SignatureAlgorithm::HmacSha256 => {
            let key = hmac_key.unwrap_or(b"");
            let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
            mac.update(payload.as_bytes());
            format!("HMAC_SHA256:{}", hex::encode(mac.finalize().into_bytes()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn sha256_signature_has_expected_prefix_and_is_deterministic() {
        let ts = Utc::now();
        let matched = BTreeMap::new();
        let a = sign(SignatureAlgorithm::Sha256, None, "m1", Some("node1"), ts, 1.0, &matched);
        let b = sign(SignatureAlgorithm::Sha256, None, "m1", Some("node1"), ts, 1.0, &matched);
        assert!(a.starts_with("SHA256:"));
        assert_eq!(a, b);
    }

    #[test]
    fn different_satisfaction_level_changes_signature() {
        let ts = Utc::now();
        let matched = BTreeMap::new();
        let a = sign(SignatureAlgorithm::Sha256, None, "m1", None, ts, 1.0, &matched);
        let b = sign(SignatureAlgorithm::Sha256, None, "m1", None, ts, 0.5, &matched);
        assert_ne!(a, b);
    }

    #[test]
    fn hmac_signature_depends_on_key() {
        let ts = Utc::now();
        let matched = BTreeMap::new();
        let a = sign(SignatureAlgorithm::HmacSha256, Some(b"key-a"), "m1", None, ts, 1.0, &matched);
        let b = sign(SignatureAlgorithm::HmacSha256, Some(b"key-b"), "m1", None, ts, 1.0, &matched);
        assert!(a.starts_with("HMAC_SHA256:"));
        assert_ne!(a, b);
    }
}
