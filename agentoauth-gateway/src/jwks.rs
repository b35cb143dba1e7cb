//! JWKS resolution for issuer keys
//!
//! Resolves `kid` to an Ed25519 verifying key. Keys come from two places:
//! statically configured keys (loaded at startup) and remote JWKS documents
//! fetched lazily with a bounded-TTL cache. Stale entries keep serving while
//! a refresh is failing.

use agentoauth_core::token::verifying_key_from_bytes;
use agentoauth_core::{AgentOAuthError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cached remote keys are considered fresh for this long
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// A JSON Web Key as published in a JWKS document. Only Ed25519 OKP keys
/// are meaningful to the evaluator; other entries are skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    /// Public key bytes, base64url
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
}

impl Jwk {
    /// Publish an Ed25519 verifying key
    pub fn ed25519(kid: impl Into<String>, key: &VerifyingKey) -> Self {
        Self {
            kty: "OKP".to_string(),
            crv: Some("Ed25519".to_string()),
            x: Some(URL_SAFE_NO_PAD.encode(key.as_bytes())),
            kid: Some(kid.into()),
            key_use: Some("sig".to_string()),
            alg: Some("EdDSA".to_string()),
        }
    }

    fn verifying_key(&self) -> Result<VerifyingKey> {
        if self.kty != "OKP" || self.crv.as_deref() != Some("Ed25519") {
            return Err(AgentOAuthError::InvalidPayload(
                "not an Ed25519 OKP key".to_string(),
            ));
        }
        let x = self.x.as_deref().ok_or_else(|| {
            AgentOAuthError::InvalidPayload("JWK is missing the x coordinate".to_string())
        })?;
        let bytes = URL_SAFE_NO_PAD
            .decode(x)
            .map_err(|_| AgentOAuthError::InvalidPayload("JWK x is not base64url".to_string()))?;
        verifying_key_from_bytes(&bytes)
    }
}

/// A JWKS document body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<Jwk>,
}

struct RemoteCache {
    keys: HashMap<String, VerifyingKey>,
    fetched_at: Option<Instant>,
}

/// Resolves issuer key ids against configured and remote key sets
pub struct JwksResolver {
    urls: Vec<String>,
    client: reqwest::Client,
    ttl: Duration,
    static_keys: RwLock<HashMap<String, VerifyingKey>>,
    remote: RwLock<RemoteCache>,
}

impl JwksResolver {
    pub fn new(urls: Vec<String>, fetch_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .unwrap_or_default();
        Self {
            urls,
            client,
            ttl: DEFAULT_CACHE_TTL,
            static_keys: RwLock::new(HashMap::new()),
            remote: RwLock::new(RemoteCache {
                keys: HashMap::new(),
                fetched_at: None,
            }),
        }
    }

    /// Register a key directly, bypassing remote fetch. Used for locally
    /// trusted issuers and by tests.
    pub fn add_static_key(&self, kid: impl Into<String>, key: VerifyingKey) {
        self.static_keys.write().insert(kid.into(), key);
    }

    /// Resolve a kid to a verifying key; `None` when the kid is unknown
    /// everywhere.
    pub async fn resolve(&self, kid: &str) -> Option<VerifyingKey> {
        if let Some(key) = self.static_keys.read().get(kid) {
            return Some(*key);
        }

        let stale = {
            let remote = self.remote.read();
            match remote.fetched_at {
                Some(at) if at.elapsed() < self.ttl => {
                    return remote.keys.get(kid).copied();
                }
                _ => remote.keys.get(kid).copied(),
            }
        };

        match self.refresh().await {
            Ok(()) => self.remote.read().keys.get(kid).copied(),
            Err(e) => {
                warn!(error = %e, "JWKS refresh failed, serving stale cache");
                stale
            }
        }
    }

    /// Fetch all configured JWKS documents and swap the cache
    async fn refresh(&self) -> Result<()> {
        if self.urls.is_empty() {
            let mut remote = self.remote.write();
            remote.fetched_at = Some(Instant::now());
            return Ok(());
        }

        let mut keys = HashMap::new();
        let mut last_error: Option<String> = None;

        for url in &self.urls {
            match self.fetch_one(url).await {
                Ok(doc) => {
                    for jwk in doc.keys {
                        let kid = match jwk.kid.clone() {
                            Some(kid) => kid,
                            None => continue,
                        };
                        match jwk.verifying_key() {
                            Ok(key) => {
                                keys.insert(kid, key);
                            }
                            Err(e) => {
                                debug!(url = %url, kid = %kid, error = %e, "Skipping non-Ed25519 JWK");
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "JWKS fetch failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        if keys.is_empty() {
            if let Some(error) = last_error {
                return Err(AgentOAuthError::Internal(format!(
                    "all JWKS fetches failed: {}",
                    error
                )));
            }
        }

        let mut remote = self.remote.write();
        remote.keys = keys;
        remote.fetched_at = Some(Instant::now());
        Ok(())
    }

    async fn fetch_one(&self, url: &str) -> Result<JwksDocument> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AgentOAuthError::Internal(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| AgentOAuthError::Internal(e.to_string()))?
            .json::<JwksDocument>()
            .await
            .map_err(|e| AgentOAuthError::Internal(e.to_string()))
    }
}
