//! AgentOAuth Evaluator Gateway
//!
//! Provides:
//! - `POST /verify` and `POST /simulate` evaluation endpoints
//! - `POST /revoke` and `GET /receipts/:id` for revocation and audit
//! - decode-only `POST /lint/policy` and `POST /lint/token`
//! - JWKS publication, per-tenant usage, health/terms/version
//! - IP and tenant rate limiting, audit logging, Prometheus metrics

pub mod audit;
pub mod jwks;
pub mod lint_api;
pub mod metrics;
pub mod rate_limit;
pub mod state;
pub mod tenant;
mod verify_api;

pub use jwks::{Jwk, JwksDocument, JwksResolver};
pub use rate_limit::{IpRateLimiter, RateStatus, TenantQuotas, TenantUsage};
pub use state::{AppState, GatewayConfig};
pub use tenant::{encode_api_key, ApiKeyClaims, Tenant, TenantAuth};

use axum::Router;
use std::sync::Arc;

/// Assemble the full HTTP surface over shared application state
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(verify_api::routes())
        .merge(lint_api::routes())
        .with_state(state)
}
