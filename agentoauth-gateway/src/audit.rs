//! Audit logging for evaluator decisions
//!
//! One structured record per request, emitted as JSON to tracing under the
//! "audit" target so a subscriber can route it to a file/SIEM. Records never
//! contain secrets or full token bytes: principals are hashed with the
//! deployment salt, amounts are coarsened into bands, nonces and signatures
//! are excluded entirely.

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use agentoauth_core::Amount;

/// One audit record per completed request
#[derive(Debug, Default, Serialize)]
pub struct AuditRecord {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,

    /// Salted hash of the peer address
    #[serde(skip_serializing_if = "String::is_empty")]
    pub peer: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,

    pub status: u16,

    pub latency_ms: u64,

    /// Salted hash of the principal, when a token decoded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Salted hash of the delegate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_band: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,

    /// Set when an ALLOW went out without a stored receipt (signing or
    /// storage failed)
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub receipt_omitted: bool,
}

#[derive(Debug, Serialize)]
struct AuditLogEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    record: &'a AuditRecord,
}

/// Emit an audit record. Failures here never fail the response.
pub fn audit_log(record: &AuditRecord) {
    let entry = AuditLogEntry {
        timestamp: Utc::now().to_rfc3339(),
        record,
    };
    if let Ok(json) = serde_json::to_string(&entry) {
        info!(target: "audit", "{}", json);
    }
}

/// Salted, truncated SHA-256 of an identifier. Stable within a deployment,
/// unlinkable across deployments.
pub fn fingerprint(salt: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(value.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Coarsen an amount so audit entries leak magnitude, not value
pub fn amount_band(amount: Amount) -> &'static str {
    let ten = Amount::from(10);
    let hundred = Amount::from(100);
    let thousand = Amount::from(1000);
    let ten_thousand = Amount::from(10_000);

    if amount <= Amount::ZERO {
        "0"
    } else if amount < ten {
        "<10"
    } else if amount < hundred {
        "10-100"
    } else if amount < thousand {
        "100-1k"
    } else if amount < ten_thousand {
        "1k-10k"
    } else {
        ">10k"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_salted_and_short() {
        let a = fingerprint("salt-a", "203.0.113.7");
        let b = fingerprint("salt-b", "203.0.113.7");
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
        assert_eq!(a, fingerprint("salt-a", "203.0.113.7"));
    }

    #[test]
    fn test_amount_bands() {
        assert_eq!(amount_band(Amount::ZERO), "0");
        assert_eq!(amount_band(Amount::from(3)), "<10");
        assert_eq!(amount_band(Amount::from(42)), "10-100");
        assert_eq!(amount_band(Amount::from(300)), "100-1k");
        assert_eq!(amount_band(Amount::from(1700)), "1k-10k");
        assert_eq!(amount_band(Amount::from(50_000)), ">10k");
    }

    #[test]
    fn test_record_serialization_excludes_empty_fields() {
        let record = AuditRecord {
            method: "POST".to_string(),
            path: "/verify".to_string(),
            peer: fingerprint("s", "127.0.0.1"),
            status: 200,
            latency_ms: 12,
            decision: Some("ALLOW".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"decision\":\"ALLOW\""));
        assert!(!json.contains("receipt_omitted"));
        assert!(!json.contains("tenant"));
    }
}
