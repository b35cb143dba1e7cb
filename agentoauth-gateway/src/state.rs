//! Application state
//!
//! Shared state for all gateway handlers: the state manager, receipt
//! signer, JWKS resolver, tenant authentication, and rate limiters. Secrets
//! (receipt key, audit salt) are loaded once at start and read-only in the
//! request path.

use crate::jwks::JwksResolver;
use crate::rate_limit::{IpRateLimiter, TenantQuotas, TenantUsage};
use crate::tenant::TenantAuth;
use agentoauth_core::{IntentConfig, ReceiptSigner};
use agentoauth_state::StateManager;
use agentoauth_store::{KvStore, MemoryStore, RedisStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Relying party id expected in WebAuthn intents
    pub rp_id: String,

    /// Hex seed of the receipt signing key; generated when absent (dev)
    pub signing_private_key: Option<String>,

    /// Key id published for the receipt key
    pub signing_kid: String,

    /// Salt for peer/principal fingerprints in the audit log
    pub audit_salt: Option<String>,

    /// Free-tier tenant quotas
    pub free_tier_daily: u64,
    pub free_tier_monthly: u64,

    /// Per-IP limits
    pub ip_limit_min: u64,
    pub ip_limit_hour: u64,

    /// Redis URL; in-memory state when absent
    pub state_backend_url: Option<String>,

    /// Remote JWKS documents for issuer keys
    pub jwks_urls: Vec<String>,

    /// HMAC secret validating API-key capabilities
    pub api_key_secret: Option<String>,

    /// This evaluator's identifier for `aud` checks
    pub expected_audience: Option<String>,

    /// Reject intents whose credential has no registered key
    pub intent_require_registered_key: bool,

    /// Tenants for which the rejection mode applies even when the
    /// deployment default is permissive
    pub intent_strict_tenants: Vec<String>,

    /// Overall per-request deadline
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rp_id: "agentoauth.local".to_string(),
            signing_private_key: None,
            signing_kid: "receipt-key-1".to_string(),
            audit_salt: None,
            free_tier_daily: 1000,
            free_tier_monthly: 10_000,
            ip_limit_min: 60,
            ip_limit_hour: 1000,
            state_backend_url: None,
            jwks_urls: Vec::new(),
            api_key_secret: None,
            expected_audience: None,
            intent_require_registered_key: false,
            intent_strict_tenants: Vec::new(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl GatewayConfig {
    /// Create config from environment variables.
    ///
    /// In production (AGENTOAUTH_ENV=production), SIGNING_PRIVATE_KEY and
    /// AUDIT_SALT are required; in development random values are generated.
    pub fn from_env() -> Self {
        let is_production = std::env::var("AGENTOAUTH_ENV")
            .map(|v| v.to_lowercase() == "production")
            .unwrap_or(false);

        let signing_private_key = std::env::var("SIGNING_PRIVATE_KEY").ok();
        if is_production && signing_private_key.is_none() {
            panic!(
                "SIGNING_PRIVATE_KEY is required in production. \
                 Set AGENTOAUTH_ENV=development to use a throwaway key for testing."
            );
        }

        let audit_salt = std::env::var("AUDIT_SALT").ok();
        if is_production && audit_salt.is_none() {
            panic!("AUDIT_SALT is required in production");
        }

        let jwks_urls = std::env::var("JWKS_URLS")
            .map(|s| {
                s.split(',')
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            rp_id: std::env::var("RP_ID").unwrap_or_else(|_| "agentoauth.local".to_string()),
            signing_private_key,
            signing_kid: std::env::var("SIGNING_KID")
                .unwrap_or_else(|_| "receipt-key-1".to_string()),
            audit_salt,
            free_tier_daily: env_number("FREE_TIER_DAILY", 1000),
            free_tier_monthly: env_number("FREE_TIER_MONTHLY", 10_000),
            ip_limit_min: env_number("IP_LIMIT_MIN", 60),
            ip_limit_hour: env_number("IP_LIMIT_HOUR", 1000),
            state_backend_url: std::env::var("STATE_BACKEND_URL").ok(),
            jwks_urls,
            api_key_secret: std::env::var("API_KEY_SECRET").ok(),
            expected_audience: std::env::var("AUDIENCE").ok(),
            intent_require_registered_key: std::env::var("INTENT_REQUIRE_REGISTERED_KEY")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(false),
            intent_strict_tenants: std::env::var("INTENT_STRICT_TENANTS")
                .map(|s| {
                    s.split(',')
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            request_timeout: Duration::from_secs(env_number("REQUEST_TIMEOUT_SECS", 5)),
        }
    }
}

fn env_number(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Application state shared across all handlers
pub struct AppState {
    config: GatewayConfig,

    /// Stateful evaluation (budgets, replay, idempotency, revocations)
    state: StateManager,

    receipt_signer: ReceiptSigner,

    jwks: JwksResolver,

    tenant_auth: TenantAuth,

    ip_limiter: IpRateLimiter,

    usage: TenantUsage,

    intent_config: IntentConfig,

    intent_strict_tenants: HashSet<String>,

    audit_salt: String,
}

impl AppState {
    /// Initialize from configuration, connecting to the state back-end
    pub async fn with_config(config: GatewayConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn KvStore> = match config.state_backend_url.as_deref() {
            Some(url) => Arc::new(RedisStore::connect(url).await?),
            None => {
                info!("No STATE_BACKEND_URL configured, using in-memory state");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_store(config, store))
    }

    /// Initialize over an explicit store. Tests use this with a shared
    /// in-memory store.
    pub fn with_store(config: GatewayConfig, store: Arc<dyn KvStore>) -> Self {
        let receipt_signer = match config.signing_private_key.as_deref() {
            Some(seed) => ReceiptSigner::from_hex_seed(seed, config.signing_kid.clone())
                .expect("SIGNING_PRIVATE_KEY must be a 32-byte hex seed"),
            None => {
                warn!("SIGNING_PRIVATE_KEY not set, using a throwaway receipt key");
                ReceiptSigner::generate(config.signing_kid.clone())
            }
        };

        let audit_salt = config.audit_salt.clone().unwrap_or_else(|| {
            warn!("AUDIT_SALT not set, using a random salt (fingerprints reset on restart)");
            hex::encode(rand::random::<[u8; 16]>())
        });

        let free_quotas = TenantQuotas {
            daily: config.free_tier_daily,
            monthly: config.free_tier_monthly,
        };

        let intent_config = IntentConfig::new(config.rp_id.clone())
            .require_registered_key(config.intent_require_registered_key);
        let intent_strict_tenants: HashSet<String> =
            config.intent_strict_tenants.iter().cloned().collect();

        Self {
            state: StateManager::new(store),
            receipt_signer,
            jwks: JwksResolver::new(config.jwks_urls.clone(), config.request_timeout),
            tenant_auth: TenantAuth::new(
                config.api_key_secret.as_deref().map(str::as_bytes),
                free_quotas,
            ),
            ip_limiter: IpRateLimiter::new(config.ip_limit_min, config.ip_limit_hour),
            usage: TenantUsage::new(),
            intent_config,
            intent_strict_tenants,
            audit_salt,
            config,
        }
    }

    /// Replace the intent configuration (registered credential keys,
    /// per-tenant strictness)
    pub fn with_intent_config(mut self, intent_config: IntentConfig) -> Self {
        self.intent_config = intent_config;
        self
    }

    /// Register a trusted issuer key directly
    pub fn add_issuer_key(&self, kid: impl Into<String>, key: ed25519_dalek::VerifyingKey) {
        self.jwks.add_static_key(kid, key);
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn receipt_signer(&self) -> &ReceiptSigner {
        &self.receipt_signer
    }

    pub fn jwks(&self) -> &JwksResolver {
        &self.jwks
    }

    pub fn tenant_auth(&self) -> &TenantAuth {
        &self.tenant_auth
    }

    pub fn ip_limiter(&self) -> &IpRateLimiter {
        &self.ip_limiter
    }

    pub fn usage(&self) -> &TenantUsage {
        &self.usage
    }

    pub fn intent_config(&self) -> &IntentConfig {
        &self.intent_config
    }

    /// Whether an unverified intent must be rejected for this tenant
    pub fn intent_strict_for(&self, tenant_id: &str) -> bool {
        self.intent_config.require_registered_key
            || self.intent_strict_tenants.contains(tenant_id)
    }

    pub fn audit_salt(&self) -> &str {
        &self.audit_salt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_free_tier() {
        let config = GatewayConfig::default();
        assert_eq!(config.free_tier_daily, 1000);
        assert_eq!(config.free_tier_monthly, 10_000);
        assert_eq!(config.ip_limit_min, 60);
        assert_eq!(config.ip_limit_hour, 1000);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_state_from_memory_store() {
        let state = AppState::with_store(GatewayConfig::default(), Arc::new(MemoryStore::new()));
        assert_eq!(state.config().rp_id, "agentoauth.local");
        assert_eq!(state.audit_salt().len(), 32);
    }
}
