//! Compact JWS token codec
//!
//! Parses `header.payload.signature` tokens and verifies EdDSA (Ed25519)
//! signatures. Decoding is pure computation with no I/O; the caller resolves
//! the verification key (by `kid`) before the verify step.

use crate::error::{AgentOAuthError, Result};
use crate::types::TokenPayload;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only JWS algorithm the evaluator accepts
pub const ALG_EDDSA: &str = "EdDSA";

/// JWS protected header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwsHeader {
    pub alg: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

impl JwsHeader {
    pub fn eddsa(kid: impl Into<String>) -> Self {
        Self {
            alg: ALG_EDDSA.to_string(),
            kid: Some(kid.into()),
            typ: Some("JWT".to_string()),
        }
    }

    /// Reject any algorithm other than EdDSA
    pub fn ensure_eddsa(&self) -> Result<()> {
        if self.alg == ALG_EDDSA {
            Ok(())
        } else {
            Err(AgentOAuthError::UnsupportedAlg(self.alg.clone()))
        }
    }
}

/// A parsed token, signature not yet verified
#[derive(Debug, Clone)]
pub struct DecodedToken {
    pub header: JwsHeader,
    pub payload: TokenPayload,

    /// Payload as raw JSON; policy hashing runs over this so unknown
    /// fields and original number forms survive the round trip
    pub payload_raw: Value,

    signing_input: String,
    signature: Vec<u8>,
}

impl DecodedToken {
    /// Parse a compact-serialized token. No signature check, no I/O.
    pub fn decode(token: &str) -> Result<Self> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(AgentOAuthError::InvalidToken(
                "expected three dot-separated segments".to_string(),
            ));
        }

        let header_bytes = decode_segment(parts[0], "header")?;
        let payload_bytes = decode_segment(parts[1], "payload")?;
        let signature = decode_segment(parts[2], "signature")?;

        let header: JwsHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| AgentOAuthError::InvalidToken(format!("header is not valid JSON: {}", e)))?;

        let payload_raw: Value = serde_json::from_slice(&payload_bytes).map_err(|e| {
            AgentOAuthError::InvalidToken(format!("payload is not valid JSON: {}", e))
        })?;

        let payload: TokenPayload = serde_json::from_value(payload_raw.clone())
            .map_err(|e| AgentOAuthError::InvalidPayload(e.to_string()))?;

        Ok(Self {
            header,
            payload,
            payload_raw,
            signing_input: format!("{}.{}", parts[0], parts[1]),
            signature,
        })
    }

    /// Verify the EdDSA signature with a resolved public key
    pub fn verify_signature(&self, key: &VerifyingKey) -> Result<()> {
        self.header.ensure_eddsa()?;

        let sig_bytes: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| AgentOAuthError::InvalidSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);

        key.verify(self.signing_input.as_bytes(), &signature)
            .map_err(|_| AgentOAuthError::InvalidSignature)
    }

    /// The raw `policy` value as it appeared on the wire
    pub fn raw_policy(&self) -> Option<&Value> {
        self.payload_raw.get("policy")
    }
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AgentOAuthError::InvalidToken(format!("{} is not valid base64url", what)))
}

/// Produce a compact JWS over arbitrary claims. Used by the receipt signer
/// and by tests that mint tokens.
pub fn sign_compact<T: Serialize>(header: &JwsHeader, claims: &T, key: &SigningKey) -> Result<String> {
    let header_json = serde_json::to_vec(header)
        .map_err(|e| AgentOAuthError::Signing(format!("header serialization failed: {}", e)))?;
    let claims_json = serde_json::to_vec(claims)
        .map_err(|e| AgentOAuthError::Signing(format!("claims serialization failed: {}", e)))?;

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header_json),
        URL_SAFE_NO_PAD.encode(claims_json)
    );
    let signature = key.sign(signing_input.as_bytes());

    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

/// Parse an Ed25519 public key from the raw 32-byte form
pub fn verifying_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| AgentOAuthError::InvalidPayload("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&array)
        .map_err(|e| AgentOAuthError::InvalidPayload(format!("invalid Ed25519 public key: {}", e)))
}
