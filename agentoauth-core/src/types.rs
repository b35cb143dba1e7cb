//! Wire-level data model for AgentOAuth tokens and requests
//!
//! Tokens are created outside the evaluator and are immutable here; the
//! evaluator only decodes and validates them.

use crate::amount::Amount;
use crate::canonical;
use crate::error::{AgentOAuthError, Result};
use crate::intent::Intent;
use crate::policy::Policy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token payload version with plain delegation semantics
pub const TOKEN_VERSION_V02: &str = "act.v0.2";

/// Token payload version that additionally carries a signed human intent
pub const TOKEN_VERSION_V03: &str = "act.v0.3";

/// Minimum length of a `jti`
pub const MIN_JTI_LEN: usize = 8;

/// `scope` claim: a single action name or a list of them
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ScopeClaim {
    One(String),
    Many(Vec<String>),
}

impl ScopeClaim {
    pub fn actions(&self) -> impl Iterator<Item = &str> {
        match self {
            ScopeClaim::One(s) => std::slice::from_ref(s).iter().map(String::as_str),
            ScopeClaim::Many(v) => v[..].iter().map(String::as_str),
        }
    }
}

/// Decoded token payload (`act.v0.2` / `act.v0.3`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub ver: String,

    /// Unique token identifier; replay protection key
    pub jti: String,

    /// Stable identifier of the human principal
    pub user: String,

    /// Stable identifier of the delegate acting on the principal's behalf
    pub agent: String,

    pub scope: ScopeClaim,

    /// Issuer identifier; doubles as the tenant key on keyless requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Intended recipient
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,

    /// Expiry, seconds since epoch
    pub exp: i64,

    /// High-entropy anti-replay value
    pub nonce: String,

    pub policy: Policy,

    /// `sha256:<hex>` over the canonical policy
    pub policy_hash: String,

    /// Required for `act.v0.3`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
}

impl TokenPayload {
    /// Semantic validation of the payload; structural decoding has already
    /// succeeded when this runs.
    pub fn validate(&self) -> Result<()> {
        match self.ver.as_str() {
            TOKEN_VERSION_V02 => {}
            TOKEN_VERSION_V03 => {
                if self.intent.is_none() {
                    return Err(AgentOAuthError::InvalidPayload(
                        "act.v0.3 token is missing the intent block".to_string(),
                    ));
                }
            }
            other => return Err(AgentOAuthError::UnsupportedVersion(other.to_string())),
        }

        if self.jti.len() < MIN_JTI_LEN {
            return Err(AgentOAuthError::InvalidPayload(format!(
                "jti must be at least {} characters",
                MIN_JTI_LEN
            )));
        }
        if self.user.is_empty() || self.agent.is_empty() {
            return Err(AgentOAuthError::InvalidPayload(
                "user and agent identifiers are required".to_string(),
            ));
        }
        if self.nonce.is_empty() {
            return Err(AgentOAuthError::InvalidPayload("nonce is required".to_string()));
        }
        if !canonical::is_hash_format(&self.policy_hash) {
            return Err(AgentOAuthError::InvalidPayload(
                "policy_hash must be sha256:<64 lowercase hex>".to_string(),
            ));
        }

        self.policy.validate()?;
        Ok(())
    }

    /// Whether the token has expired as of `at`
    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        self.exp <= at.timestamp()
    }
}

/// The concrete request being evaluated against a token's policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,

    /// Client-supplied key making apply safely retriable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Evaluation instant; defaults to "now" when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A concrete resource named by a request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
}

/// Evaluation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "ALLOW")]
    Allow,
    #[serde(rename = "DENY")]
    Deny,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Allow => f.write_str("ALLOW"),
            Decision::Deny => f.write_str("DENY"),
        }
    }
}
