//! Error types for AgentOAuth
//!
//! Provides a unified error type for the evaluator plus the stable machine
//! codes surfaced to API clients.

use thiserror::Error;

/// Result type alias for AgentOAuth operations
pub type Result<T> = std::result::Result<T, AgentOAuthError>;

/// Stable machine-readable codes carried in API responses.
///
/// Every user-visible failure maps to exactly one of these; the HTTP layer
/// derives the status class from the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    MissingToken,
    InvalidToken,
    UnsupportedAlg,
    InvalidPayload,
    UnsupportedVersion,
    InvalidSignature,
    UnknownKid,
    Expired,
    AudienceMismatch,
    MissingIssuer,
    InvalidApiKey,
    IpRateLimit,
    QuotaExceeded,
    PolicyHashMismatch,
    IntentExpired,
    IntentInvalid,
    IntentPolicyMismatch,
    Revoked,
    PolicyRevoked,
    VerifierUnavailable,
    Replay,
    PolicyError,
}

impl ErrorCode {
    /// The wire form of the code (e.g. `POLICY_HASH_MISMATCH`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingToken => "MISSING_TOKEN",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::UnsupportedAlg => "UNSUPPORTED_ALG",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::UnknownKid => "UNKNOWN_KID",
            Self::Expired => "EXPIRED",
            Self::AudienceMismatch => "AUDIENCE_MISMATCH",
            Self::MissingIssuer => "MISSING_ISSUER",
            Self::InvalidApiKey => "INVALID_API_KEY",
            Self::IpRateLimit => "IP_RATE_LIMIT",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::PolicyHashMismatch => "POLICY_HASH_MISMATCH",
            Self::IntentExpired => "INTENT_EXPIRED",
            Self::IntentInvalid => "INTENT_INVALID",
            Self::IntentPolicyMismatch => "INTENT_POLICY_MISMATCH",
            Self::Revoked => "REVOKED",
            Self::PolicyRevoked => "POLICY_REVOKED",
            Self::VerifierUnavailable => "VERIFIER_UNAVAILABLE",
            Self::Replay => "REPLAY",
            Self::PolicyError => "POLICY_ERROR",
        }
    }

    /// HTTP status class for this code
    pub fn http_status(&self) -> u16 {
        match self {
            Self::MissingToken
            | Self::InvalidToken
            | Self::UnsupportedAlg
            | Self::InvalidPayload
            | Self::UnsupportedVersion
            | Self::MissingIssuer
            | Self::PolicyHashMismatch
            | Self::PolicyError => 400,

            Self::InvalidSignature | Self::UnknownKid | Self::Expired | Self::InvalidApiKey => 401,

            Self::AudienceMismatch
            | Self::IntentExpired
            | Self::IntentInvalid
            | Self::IntentPolicyMismatch
            | Self::Revoked
            | Self::PolicyRevoked
            | Self::Replay => 403,

            Self::IpRateLimit | Self::QuotaExceeded => 429,

            Self::VerifierUnavailable => 503,
        }
    }

    /// Advisory hint for developers; not part of the security contract.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::MissingToken => Some("Include the delegation token in the `token` field"),
            Self::InvalidToken => {
                Some("Tokens are compact JWS: three base64url segments separated by dots")
            }
            Self::UnsupportedAlg => Some("Only EdDSA (Ed25519) tokens are accepted"),
            Self::UnknownKid => Some("Ensure the issuer's JWKS is reachable and contains this kid"),
            Self::Expired => Some("Request a fresh token from the issuer"),
            Self::MissingIssuer => {
                Some("Keyless requests require an `iss` claim; or present an API key")
            }
            Self::PolicyHashMismatch => {
                Some("Recompute policy_hash over the canonical policy before signing")
            }
            Self::IntentExpired => Some("A new human approval gesture is required"),
            Self::QuotaExceeded => Some("Upgrade the tenant tier or wait for the quota window"),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the evaluator core
#[derive(Error, Debug)]
pub enum AgentOAuthError {
    // ===== Token Codec Errors =====
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlg(String),

    #[error("Unknown key id: {0}")]
    UnknownKid(String),

    #[error("Invalid signature")]
    InvalidSignature,

    // ===== Payload Errors =====
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unsupported token version: {0}")]
    UnsupportedVersion(String),

    #[error("Token expired")]
    Expired,

    #[error("Audience mismatch: expected {expected}, got {actual}")]
    AudienceMismatch { expected: String, actual: String },

    #[error("Policy hash mismatch")]
    PolicyHashMismatch,

    #[error("Policy error: {0}")]
    PolicyError(String),

    #[error("Invalid API key: {0}")]
    InvalidApiKey(String),

    #[error("Missing issuer")]
    MissingIssuer,

    // ===== Intent Errors =====
    #[error("Intent expired at {0}")]
    IntentExpired(chrono::DateTime<chrono::Utc>),

    #[error("Intent invalid: {0}")]
    IntentInvalid(String),

    #[error("Intent bound to a different policy")]
    IntentPolicyMismatch,

    // ===== Signing Errors =====
    #[error("Signing error: {0}")]
    Signing(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentOAuthError {
    /// The stable machine code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidToken(_) => ErrorCode::InvalidToken,
            Self::UnsupportedAlg(_) => ErrorCode::UnsupportedAlg,
            Self::UnknownKid(_) => ErrorCode::UnknownKid,
            Self::InvalidSignature => ErrorCode::InvalidSignature,
            Self::InvalidPayload(_) => ErrorCode::InvalidPayload,
            Self::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            Self::Expired => ErrorCode::Expired,
            Self::AudienceMismatch { .. } => ErrorCode::AudienceMismatch,
            Self::PolicyHashMismatch => ErrorCode::PolicyHashMismatch,
            Self::PolicyError(_) => ErrorCode::PolicyError,
            Self::InvalidApiKey(_) => ErrorCode::InvalidApiKey,
            Self::MissingIssuer => ErrorCode::MissingIssuer,
            Self::IntentExpired(_) => ErrorCode::IntentExpired,
            Self::IntentInvalid(_) => ErrorCode::IntentInvalid,
            Self::IntentPolicyMismatch => ErrorCode::IntentPolicyMismatch,
            Self::Signing(_) | Self::Internal(_) => ErrorCode::VerifierUnavailable,
        }
    }
}
