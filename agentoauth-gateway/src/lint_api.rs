//! Lint and operational endpoints
//!
//! `POST /lint/policy` and `POST /lint/token` are decode-only validators:
//! they never fetch keys or touch state, and return the canonical form and
//! hash alongside structured findings. The well-known JWKS document, the
//! per-tenant usage counters, and the health/terms/version pages live here
//! too.

use crate::jwks::{Jwk, JwksDocument};
use crate::state::AppState;
use crate::verify_api::{apply_rate_headers, client_ip};
use agentoauth_core::{canonical, AgentOAuthError, DecodedToken, ErrorCode, Policy};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Create lint and operational routes
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/lint/policy", post(lint_policy))
        .route("/lint/token", post(lint_token))
        .route("/.well-known/jwks.json", get(jwks_document))
        .route("/usage", get(usage))
        .route("/health", get(health))
        .route("/terms", get(terms))
        .route("/version", get(version))
}

/// One finding from a lint run
#[derive(Debug, Serialize)]
struct LintFinding {
    error: String,
    code: &'static str,
}

impl LintFinding {
    fn new(error: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            error: error.into(),
            code: code.as_str(),
        }
    }

    fn from_error(e: &AgentOAuthError) -> Self {
        Self {
            error: e.to_string(),
            code: e.code().as_str(),
        }
    }
}

async fn lint_policy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    rate_limited(&state, &headers, |_| lint_policy_inner(&body))
}

async fn lint_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    rate_limited(&state, &headers, |_| lint_token_inner(&body))
}

/// Apply the per-IP band and rate headers around a pure handler
fn rate_limited(
    state: &AppState,
    headers: &HeaderMap,
    handler: impl FnOnce(&AppState) -> (StatusCode, Value),
) -> Response {
    let ip = client_ip(headers);
    let rate = state.ip_limiter().check(&ip);
    if !rate.allowed {
        crate::metrics::record_rate_limited("ip");
        let code = ErrorCode::IpRateLimit;
        let body = json!({
            "valid": false,
            "error": "Too many requests from this address",
            "code": code.as_str(),
            "resetTime": rate.reset_secs,
        });
        return apply_rate_headers(
            (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response(),
            &rate,
        );
    }

    let (status, body) = handler(state);
    apply_rate_headers((status, Json(body)).into_response(), &rate)
}

fn lint_policy_inner(body: &str) -> (StatusCode, Value) {
    let raw: Value = match serde_json::from_str(body) {
        Ok(raw) => raw,
        Err(e) => {
            let finding =
                LintFinding::new(format!("invalid JSON body: {}", e), ErrorCode::InvalidPayload);
            return (
                StatusCode::BAD_REQUEST,
                json!({"valid": false, "errors": [finding]}),
            );
        }
    };

    let mut findings = lint_policy_value(&raw);

    let canonical_form = match canonical::canonicalize(&raw) {
        Ok(canonical_form) => Some(canonical_form),
        Err(e) => {
            findings.push(LintFinding::from_error(&e));
            None
        }
    };
    let hash = canonical::hash(&raw).ok();

    let valid = findings.is_empty();
    let status = if valid { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    (
        status,
        json!({
            "valid": valid,
            "canonical": canonical_form,
            "hash": hash,
            "errors": findings,
        }),
    )
}

/// Structural findings for a policy document
fn lint_policy_value(raw: &Value) -> Vec<LintFinding> {
    let mut findings = Vec::new();

    let policy: Policy = match serde_json::from_value(raw.clone()) {
        Ok(policy) => policy,
        Err(e) => {
            findings.push(LintFinding::new(e.to_string(), ErrorCode::PolicyError));
            return findings;
        }
    };

    if let Err(e) = policy.validate() {
        findings.push(LintFinding::from_error(&e));
    }

    if !policy.unknown.is_empty() {
        let names: Vec<&str> = policy.unknown.keys().map(String::as_str).collect();
        if policy.strict.unwrap_or(false) {
            findings.push(LintFinding::new(
                format!("unknown fields in strict policy: {}", names.join(", ")),
                ErrorCode::PolicyError,
            ));
        } else {
            debug!(fields = ?names, "Policy carries unknown fields");
        }
    }

    findings
}

fn lint_token_inner(body: &str) -> (StatusCode, Value) {
    let request: Value = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(e) => {
            let finding =
                LintFinding::new(format!("invalid JSON body: {}", e), ErrorCode::InvalidPayload);
            return (
                StatusCode::BAD_REQUEST,
                json!({"valid": false, "errors": [finding]}),
            );
        }
    };
    let token = match request.get("token").and_then(Value::as_str) {
        Some(token) if !token.is_empty() => token,
        _ => {
            let finding = LintFinding::new("token is required", ErrorCode::MissingToken);
            return (
                StatusCode::BAD_REQUEST,
                json!({"valid": false, "errors": [finding]}),
            );
        }
    };

    // Decode-only: no JWKS fetch, no signature verification
    let decoded = match DecodedToken::decode(token) {
        Ok(decoded) => decoded,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                json!({"valid": false, "errors": [LintFinding::from_error(&e)]}),
            );
        }
    };

    let mut findings = Vec::new();
    if let Err(e) = decoded.header.ensure_eddsa() {
        findings.push(LintFinding::from_error(&e));
    }
    if let Err(e) = decoded.payload.validate() {
        findings.push(LintFinding::from_error(&e));
    }

    let computed_hash = decoded.raw_policy().and_then(|raw| canonical::hash(raw).ok());
    let hash_matches = computed_hash.as_deref() == Some(decoded.payload.policy_hash.as_str());
    if !hash_matches {
        findings.push(LintFinding::new(
            "policy_hash does not match the canonical policy",
            ErrorCode::PolicyHashMismatch,
        ));
    }

    let valid = findings.is_empty();
    let status = if valid { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    (
        status,
        json!({
            "valid": valid,
            "header": {"alg": decoded.header.alg, "kid": decoded.header.kid},
            "ver": decoded.payload.ver,
            "jti": decoded.payload.jti,
            "policy_id": decoded.payload.policy.id,
            "policy_hash": decoded.payload.policy_hash,
            "computed_hash": computed_hash,
            "errors": findings,
        }),
    )
}

/// Public keys this deployment signs with (receipt key) plus any statically
/// trusted issuer keys the deployment chooses to publish.
async fn jwks_document(State(state): State<Arc<AppState>>) -> Json<JwksDocument> {
    let signer = state.receipt_signer();
    let keys = vec![Jwk::ed25519(signer.kid(), &signer.verifying_key())];
    Json(JwksDocument { keys })
}

/// Per-tenant counters; requires an authenticated tenant
async fn usage(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    rate_limited(&state, &headers, |state| {
        match state.tenant_auth().authenticate(&headers) {
            Ok(Some(tenant)) => {
                let snapshot = state.usage().snapshot(&tenant.id, tenant.quotas, Utc::now());
                (
                    StatusCode::OK,
                    json!({
                        "tenant": tenant.id,
                        "tier": tenant.tier,
                        "usage": snapshot,
                    }),
                )
            }
            Ok(None) => (
                StatusCode::UNAUTHORIZED,
                json!({
                    "error": "usage requires an authenticated tenant",
                    "code": ErrorCode::InvalidApiKey.as_str(),
                }),
            ),
            Err(e) => {
                let code = e.code();
                (
                    StatusCode::from_u16(code.http_status())
                        .unwrap_or(StatusCode::UNAUTHORIZED),
                    json!({"error": e.to_string(), "code": code.as_str()}),
                )
            }
        }
    })
}

async fn health() -> &'static str {
    "OK"
}

async fn terms() -> &'static str {
    "AgentOAuth evaluator. Decisions are advisory records of policy \
     evaluation; tokens and receipts carry no payment obligation. \
     Abuse of the free tier results in revocation of keyless access."
}

async fn version() -> &'static str {
    concat!("agentoauth-gateway/", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lint_policy_happy_path() {
        let body = json!({
            "version": "pol.v0.2",
            "id": "pol_1",
            "actions": ["payments.send"],
        })
        .to_string();

        let (status, result) = lint_policy_inner(&body);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["valid"], json!(true));
        assert!(result["hash"].as_str().unwrap().starts_with("sha256:"));
    }

    #[test]
    fn test_lint_policy_rejects_strict_unknown_fields() {
        let body = json!({
            "version": "pol.v0.2",
            "id": "pol_1",
            "actions": ["payments.send"],
            "strict": true,
            "shadow_limit": 9
        })
        .to_string();

        let (status, result) = lint_policy_inner(&body);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(result["errors"][0]["code"], "POLICY_ERROR");
    }

    #[test]
    fn test_lint_policy_tolerates_unknown_fields_without_strict() {
        let body = json!({
            "version": "pol.v0.2",
            "id": "pol_1",
            "actions": ["payments.send"],
            "shadow_limit": 9
        })
        .to_string();

        let (status, _) = lint_policy_inner(&body);
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn test_lint_policy_bad_json() {
        let (status, result) = lint_policy_inner("{not json");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(result["valid"], json!(false));
    }

    #[test]
    fn test_lint_token_requires_token_field() {
        let (status, result) = lint_token_inner(&json!({}).to_string());
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(result["errors"][0]["code"], "MISSING_TOKEN");
    }
}
