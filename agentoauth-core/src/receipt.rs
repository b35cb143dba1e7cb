//! Signed decision receipts
//!
//! Receipts are evaluator-signed records of ALLOW/DENY outcomes, stored by
//! id for audit. Signing uses a dedicated key whose kid is distinct from
//! issuer keys.

use crate::amount::Amount;
use crate::error::{AgentOAuthError, Result};
use crate::token::{sign_compact, JwsHeader};
use crate::types::Decision;
use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Receipt schema version
pub const RECEIPT_VERSION: &str = "receipt.v0.2";

/// Evaluator-signed record of a decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub version: String,

    /// `rcpt_<32-hex>`
    pub id: String,

    pub policy_id: String,

    pub decision: Decision,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<RemainingBudget>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_verified: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_valid_until: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_approved_at: Option<DateTime<Utc>>,
}

/// Budget left in the current period after the decision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemainingBudget {
    pub amount: Amount,
    pub currency: String,
    pub period_ends: DateTime<Utc>,
}

impl Receipt {
    pub fn allow(id: String, policy_id: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            version: RECEIPT_VERSION.to_string(),
            id,
            policy_id,
            decision: Decision::Allow,
            reason: None,
            timestamp,
            remaining: None,
            intent_verified: None,
            intent_valid_until: None,
            intent_approved_at: None,
        }
    }

    pub fn deny(id: String, policy_id: String, reason: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            version: RECEIPT_VERSION.to_string(),
            id,
            policy_id,
            decision: Decision::Deny,
            reason: Some(reason),
            timestamp,
            remaining: None,
            intent_verified: None,
            intent_valid_until: None,
            intent_approved_at: None,
        }
    }
}

/// Signs receipts with the deployment's dedicated receipt key
pub struct ReceiptSigner {
    signing_key: SigningKey,
    kid: String,
}

impl ReceiptSigner {
    pub fn new(signing_key: SigningKey, kid: impl Into<String>) -> Self {
        Self {
            signing_key,
            kid: kid.into(),
        }
    }

    /// Load from a 32-byte hex seed (the `SIGNING_PRIVATE_KEY` format)
    pub fn from_hex_seed(hex_seed: &str, kid: impl Into<String>) -> Result<Self> {
        let bytes = hex::decode(hex_seed)
            .map_err(|_| AgentOAuthError::Signing("signing key must be hex".to_string()))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AgentOAuthError::Signing("signing key must be 32 bytes".to_string()))?;
        Ok(Self::new(SigningKey::from_bytes(&seed), kid))
    }

    /// Generate a throwaway signer. Development and tests only; receipts
    /// signed with it cannot be re-verified after restart.
    pub fn generate(kid: impl Into<String>) -> Self {
        use rand::rngs::OsRng;
        Self::new(SigningKey::generate(&mut OsRng), kid)
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Public half of the receipt key, for JWKS publication
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Mint a fresh receipt id
    pub fn new_receipt_id() -> String {
        format!("rcpt_{}", hex::encode(rand::random::<[u8; 16]>()))
    }

    /// Sign a receipt as a compact JWS
    pub fn sign(&self, receipt: &Receipt) -> Result<String> {
        sign_compact(&JwsHeader::eddsa(self.kid.clone()), receipt, &self.signing_key)
    }
}
