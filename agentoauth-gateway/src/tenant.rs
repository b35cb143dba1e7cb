//! Tenant attribution
//!
//! Tenant identity is derived in this precedence:
//! 1. an API-key credential in `X-API-Key` or `Authorization: Bearer`,
//!    validated as a signed capability carrying `{sub, tier, quotas}`;
//! 2. the token's `iss` claim (free-tier "keyless" path).
//!
//! When both are present the API key is authoritative; `iss` stays
//! informational.

use crate::rate_limit::TenantQuotas;
use agentoauth_core::{AgentOAuthError, Result};
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A quota/attribution principal for the evaluator
#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: String,
    pub tier: String,
    pub quotas: TenantQuotas,
    /// True when attribution came from an API key rather than `iss`
    pub authenticated: bool,
}

impl Tenant {
    pub fn keyless(issuer: &str, quotas: TenantQuotas) -> Self {
        Self {
            id: issuer.to_string(),
            tier: "free".to_string(),
            quotas,
            authenticated: false,
        }
    }
}

/// Claims carried by an API-key capability
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiKeyClaims {
    /// Tenant identifier
    pub sub: String,

    /// Pricing tier label
    pub tier: String,

    /// Tenant-specific quota ceilings; free-tier defaults apply when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quotas: Option<TenantQuotas>,

    /// Expiration (Unix timestamp)
    pub exp: i64,
}

/// Validates API-key capabilities and applies attribution precedence
pub struct TenantAuth {
    decoding_key: Option<DecodingKey>,
    validation: Validation,
    free_quotas: TenantQuotas,
}

impl TenantAuth {
    pub fn new(api_key_secret: Option<&[u8]>, free_quotas: TenantQuotas) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            decoding_key: api_key_secret.map(DecodingKey::from_secret),
            validation,
            free_quotas,
        }
    }

    /// Default quotas for keyless (free-tier) tenants
    pub fn free_quotas(&self) -> TenantQuotas {
        self.free_quotas
    }

    /// Resolve the tenant presented by the request headers, if any.
    ///
    /// `Ok(None)` means no credential was presented and the caller should
    /// fall back to the token's `iss` claim.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Tenant>> {
        let credential = match extract_credential(headers) {
            Some(credential) => credential,
            None => return Ok(None),
        };

        let decoding_key = self.decoding_key.as_ref().ok_or_else(|| {
            warn!("API key presented but no API_KEY_SECRET is configured");
            AgentOAuthError::InvalidApiKey(
                "API keys are not accepted by this deployment".to_string(),
            )
        })?;

        let data = decode::<ApiKeyClaims>(credential, decoding_key, &self.validation)
            .map_err(|e| AgentOAuthError::InvalidApiKey(e.to_string()))?;

        let claims = data.claims;
        Ok(Some(Tenant {
            id: claims.sub,
            tier: claims.tier,
            quotas: claims.quotas.unwrap_or(self.free_quotas),
            authenticated: true,
        }))
    }
}

/// Mint an API-key capability. Operational tooling for deployments and
/// tests; the gateway itself only validates.
pub fn encode_api_key(secret: &[u8], claims: &ApiKeyClaims) -> Result<String> {
    encode(&Header::default(), claims, &EncodingKey::from_secret(secret))
        .map_err(|e| AgentOAuthError::Internal(format!("failed to encode API key: {}", e)))
}

fn extract_credential(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value);
        }
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
}
