//! WebAuthn intent validation
//!
//! An intent binds a policy hash to a fresh human-device gesture with an
//! explicit expiry. Expiry is exact: there is no grace period and no
//! extension mechanism; a new intent requires a new gesture.

use crate::error::{AgentOAuthError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// The only intent type understood by this validator
pub const INTENT_TYPE_WEBAUTHN: &str = "webauthn.v0";

/// Byte length of the fixed part of WebAuthn authenticator data
const AUTHENTICATOR_DATA_MIN_LEN: usize = 37;

/// A WebAuthn assertion bound to a policy hash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    #[serde(rename = "type")]
    pub intent_type: String,

    /// Credential id, base64url
    pub credential_id: String,

    /// Assertion signature, base64url
    pub signature: String,

    /// Raw clientDataJSON, base64url
    pub client_data_json: String,

    /// Raw authenticator data, base64url
    pub authenticator_data: String,

    pub approved_at: DateTime<Utc>,

    /// Exact expiry of the approval
    pub valid_until: DateTime<Utc>,

    /// Must equal the token's policy hash
    pub challenge: String,

    pub rp_id: String,
}

/// The subset of clientDataJSON the validator inspects
#[derive(Debug, Deserialize)]
struct ClientData {
    #[serde(rename = "type")]
    ceremony_type: String,

    #[serde(default)]
    #[allow(dead_code)]
    challenge: Option<String>,

    #[serde(default)]
    #[allow(dead_code)]
    origin: Option<String>,
}

/// Deployment-level intent verification settings
#[derive(Debug, Clone, Default)]
pub struct IntentConfig {
    /// Expected relying party id
    pub rp_id: String,

    /// When true, an intent whose credential has no registered key is
    /// rejected instead of passing with `intent_verified: false`
    pub require_registered_key: bool,

    /// Registered authenticator public keys, keyed by base64url
    /// credential id
    pub credential_keys: HashMap<String, VerifyingKey>,
}

impl IntentConfig {
    pub fn new(rp_id: impl Into<String>) -> Self {
        Self {
            rp_id: rp_id.into(),
            require_registered_key: false,
            credential_keys: HashMap::new(),
        }
    }

    pub fn with_credential_key(mut self, credential_id: impl Into<String>, key: VerifyingKey) -> Self {
        self.credential_keys.insert(credential_id.into(), key);
        self
    }

    pub fn require_registered_key(mut self, required: bool) -> Self {
        self.require_registered_key = required;
        self
    }
}

/// Result of a successful intent validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentOutcome {
    /// True only when full WebAuthn signature verification ran and passed
    pub verified: bool,
}

/// Validate an intent against the token's policy hash.
///
/// Check order: type, expiry, challenge binding, relying party, assertion
/// structure, then (when a key is registered) the assertion signature.
pub fn validate(
    intent: &Intent,
    policy_hash: &str,
    at: DateTime<Utc>,
    config: &IntentConfig,
) -> Result<IntentOutcome> {
    if intent.intent_type != INTENT_TYPE_WEBAUTHN {
        return Err(AgentOAuthError::IntentInvalid(format!(
            "unsupported intent type: {}",
            intent.intent_type
        )));
    }

    if at > intent.valid_until {
        return Err(AgentOAuthError::IntentExpired(intent.valid_until));
    }

    if intent.challenge != policy_hash {
        return Err(AgentOAuthError::IntentPolicyMismatch);
    }

    if intent.rp_id != config.rp_id {
        return Err(AgentOAuthError::IntentInvalid(format!(
            "relying party mismatch: {}",
            intent.rp_id
        )));
    }

    let client_data_bytes = decode_field(&intent.client_data_json, "client_data_json")?;
    let authenticator_data = decode_field(&intent.authenticator_data, "authenticator_data")?;
    let signature_bytes = decode_field(&intent.signature, "signature")?;
    decode_field(&intent.credential_id, "credential_id")?;

    let client_data: ClientData = serde_json::from_slice(&client_data_bytes).map_err(|e| {
        AgentOAuthError::IntentInvalid(format!("client_data_json is not valid JSON: {}", e))
    })?;
    if client_data.ceremony_type != "webauthn.get" {
        return Err(AgentOAuthError::IntentInvalid(format!(
            "unexpected ceremony type: {}",
            client_data.ceremony_type
        )));
    }

    if authenticator_data.len() < AUTHENTICATOR_DATA_MIN_LEN {
        return Err(AgentOAuthError::IntentInvalid(
            "authenticator_data is truncated".to_string(),
        ));
    }

    match config.credential_keys.get(&intent.credential_id) {
        Some(key) => {
            verify_assertion(
                key,
                &intent.rp_id,
                &authenticator_data,
                &client_data_bytes,
                &signature_bytes,
            )?;
            Ok(IntentOutcome { verified: true })
        }
        None if config.require_registered_key => Err(AgentOAuthError::IntentInvalid(
            "no registered authenticator key for credential".to_string(),
        )),
        None => Ok(IntentOutcome { verified: false }),
    }
}

/// Full WebAuthn assertion verification: the authenticator signs
/// `authenticator_data || SHA-256(client_data_json)`, and the first 32
/// bytes of authenticator data hash the relying party id.
fn verify_assertion(
    key: &VerifyingKey,
    rp_id: &str,
    authenticator_data: &[u8],
    client_data_bytes: &[u8],
    signature_bytes: &[u8],
) -> Result<()> {
    let rp_id_hash = Sha256::digest(rp_id.as_bytes());
    if authenticator_data[..32] != rp_id_hash[..] {
        return Err(AgentOAuthError::IntentInvalid(
            "authenticator rp_id hash mismatch".to_string(),
        ));
    }

    let sig_array: [u8; 64] = signature_bytes.try_into().map_err(|_| {
        AgentOAuthError::IntentInvalid("assertion signature must be 64 bytes".to_string())
    })?;
    let signature = Signature::from_bytes(&sig_array);

    let mut message = Vec::with_capacity(authenticator_data.len() + 32);
    message.extend_from_slice(authenticator_data);
    message.extend_from_slice(&Sha256::digest(client_data_bytes));

    key.verify(&message, &signature)
        .map_err(|_| AgentOAuthError::IntentInvalid("assertion signature verification failed".to_string()))
}

fn decode_field(value: &str, what: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| AgentOAuthError::IntentInvalid(format!("{} is not valid base64url", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    const POLICY_HASH: &str =
        "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn frozen_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 5, 12, 0, 0).unwrap()
    }

    fn authenticator_data(rp_id: &str) -> Vec<u8> {
        let mut data = Sha256::digest(rp_id.as_bytes()).to_vec();
        data.push(0x01); // flags: user present
        data.extend_from_slice(&[0, 0, 0, 7]); // counter
        data
    }

    fn signed_intent(key: &SigningKey, rp_id: &str) -> Intent {
        let client_data = serde_json::json!({
            "type": "webauthn.get",
            "challenge": URL_SAFE_NO_PAD.encode(POLICY_HASH.as_bytes()),
            "origin": format!("https://{}", rp_id),
        });
        let client_data_bytes = serde_json::to_vec(&client_data).unwrap();
        let auth_data = authenticator_data(rp_id);

        let mut message = auth_data.clone();
        message.extend_from_slice(&Sha256::digest(&client_data_bytes));
        let signature = key.sign(&message);

        Intent {
            intent_type: INTENT_TYPE_WEBAUTHN.to_string(),
            credential_id: URL_SAFE_NO_PAD.encode(b"cred-1"),
            signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
            client_data_json: URL_SAFE_NO_PAD.encode(&client_data_bytes),
            authenticator_data: URL_SAFE_NO_PAD.encode(&auth_data),
            approved_at: frozen_now() - chrono::Duration::minutes(5),
            valid_until: frozen_now() + chrono::Duration::minutes(10),
            challenge: POLICY_HASH.to_string(),
            rp_id: rp_id.to_string(),
        }
    }

    #[test]
    fn test_structural_validation_without_registered_key() {
        let key = SigningKey::generate(&mut OsRng);
        let intent = signed_intent(&key, "agentoauth.example");
        let config = IntentConfig::new("agentoauth.example");

        let outcome = validate(&intent, POLICY_HASH, frozen_now(), &config).unwrap();
        assert!(!outcome.verified);
    }

    #[test]
    fn test_full_verification_with_registered_key() {
        let key = SigningKey::generate(&mut OsRng);
        let intent = signed_intent(&key, "agentoauth.example");
        let config = IntentConfig::new("agentoauth.example")
            .with_credential_key(intent.credential_id.clone(), key.verifying_key());

        let outcome = validate(&intent, POLICY_HASH, frozen_now(), &config).unwrap();
        assert!(outcome.verified);
    }

    #[test]
    fn test_wrong_credential_key_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let intent = signed_intent(&key, "agentoauth.example");
        let config = IntentConfig::new("agentoauth.example")
            .with_credential_key(intent.credential_id.clone(), other.verifying_key());

        assert!(matches!(
            validate(&intent, POLICY_HASH, frozen_now(), &config).unwrap_err(),
            AgentOAuthError::IntentInvalid(_)
        ));
    }

    #[test]
    fn test_expired_intent_rejected_exactly() {
        let key = SigningKey::generate(&mut OsRng);
        let mut intent = signed_intent(&key, "agentoauth.example");
        intent.valid_until = frozen_now() - chrono::Duration::seconds(1);
        let config = IntentConfig::new("agentoauth.example");

        assert!(matches!(
            validate(&intent, POLICY_HASH, frozen_now(), &config).unwrap_err(),
            AgentOAuthError::IntentExpired(_)
        ));

        // Boundary: valid_until itself is still acceptable
        intent.valid_until = frozen_now();
        assert!(validate(&intent, POLICY_HASH, frozen_now(), &config).is_ok());
    }

    #[test]
    fn test_challenge_mismatch() {
        let key = SigningKey::generate(&mut OsRng);
        let intent = signed_intent(&key, "agentoauth.example");
        let config = IntentConfig::new("agentoauth.example");

        let other_hash =
            "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
        assert!(matches!(
            validate(&intent, other_hash, frozen_now(), &config).unwrap_err(),
            AgentOAuthError::IntentPolicyMismatch
        ));
    }

    #[test]
    fn test_rp_id_mismatch() {
        let key = SigningKey::generate(&mut OsRng);
        let intent = signed_intent(&key, "evil.example");
        let config = IntentConfig::new("agentoauth.example");

        assert!(matches!(
            validate(&intent, POLICY_HASH, frozen_now(), &config).unwrap_err(),
            AgentOAuthError::IntentInvalid(_)
        ));
    }

    #[test]
    fn test_wrong_ceremony_type() {
        let key = SigningKey::generate(&mut OsRng);
        let mut intent = signed_intent(&key, "agentoauth.example");
        let client_data = serde_json::json!({"type": "webauthn.create"});
        intent.client_data_json = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&client_data).unwrap());
        let config = IntentConfig::new("agentoauth.example");

        assert!(matches!(
            validate(&intent, POLICY_HASH, frozen_now(), &config).unwrap_err(),
            AgentOAuthError::IntentInvalid(_)
        ));
    }

    #[test]
    fn test_require_registered_key_mode() {
        let key = SigningKey::generate(&mut OsRng);
        let intent = signed_intent(&key, "agentoauth.example");
        let config = IntentConfig::new("agentoauth.example").require_registered_key(true);

        assert!(matches!(
            validate(&intent, POLICY_HASH, frozen_now(), &config).unwrap_err(),
            AgentOAuthError::IntentInvalid(_)
        ));
    }

    #[test]
    fn test_bad_base64_fields() {
        let key = SigningKey::generate(&mut OsRng);
        let mut intent = signed_intent(&key, "agentoauth.example");
        intent.authenticator_data = "!!not-base64!!".to_string();
        let config = IntentConfig::new("agentoauth.example");

        assert!(matches!(
            validate(&intent, POLICY_HASH, frozen_now(), &config).unwrap_err(),
            AgentOAuthError::IntentInvalid(_)
        ));
    }
}
