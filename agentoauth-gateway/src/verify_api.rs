//! Evaluation endpoints
//!
//! `POST /verify` runs the full mutating evaluation; `POST /simulate` is its
//! read-only twin; `POST /revoke` writes revocation entries; `GET
//! /receipts/:id` returns stored signed receipts.
//!
//! Per-request flow: IP rate limit, body parse, token decode, tenant
//! attribution and quota, signature verification, intent validation, policy
//! hash binding, revocation lookup, stateless checks, stateful apply,
//! receipt signing, response. The first failing stage answers and nothing
//! later runs.

use crate::audit::{amount_band, audit_log, fingerprint, AuditRecord};
use crate::metrics;
use crate::rate_limit::RateStatus;
use crate::state::AppState;
use crate::tenant::Tenant;
use agentoauth_core::{
    canonical, intent, policy, AgentOAuthError, DecodedToken, ErrorCode, Receipt, ReceiptSigner,
    RequestContext, TokenPayload, TOKEN_VERSION_V03,
};
use agentoauth_state::{ApplyOutcome, RevocationKind, SimulateOutcome, StoredDecision};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Create evaluation routes
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/verify", post(verify))
        .route("/simulate", post(simulate))
        .route("/revoke", post(revoke))
        .route("/receipts/:id", get(get_receipt))
}

/// Body of /verify and /simulate
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub context: Option<RequestContext>,
}

/// Body of /revoke
#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    #[serde(default)]
    pub jti: Option<String>,

    #[serde(default)]
    pub policy_id: Option<String>,
}

/// Internal reply shape, rendered into HTTP in one place
enum EvalReply {
    /// Input/authentication error: `{valid:false, error, code, ...}`
    Error {
        code: ErrorCode,
        message: String,
        reset: Option<u64>,
    },

    /// Policy denial: `{decision:"DENY", reason, code?}`
    Deny {
        reason: String,
        code: Option<ErrorCode>,
        simulation: bool,
    },

    /// `{decision:"ALLOW", ...}`
    Allow {
        body: Value,
        receipt_id: Option<String>,
    },
}

impl EvalReply {
    fn err(e: AgentOAuthError) -> Self {
        EvalReply::Error {
            code: e.code(),
            message: e.to_string(),
            reset: None,
        }
    }
}

async fn verify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    handle_evaluation(state, headers, body, true, "/verify").await
}

async fn simulate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    handle_evaluation(state, headers, body, false, "/simulate").await
}

async fn handle_evaluation(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: String,
    mutate: bool,
    endpoint: &'static str,
) -> Response {
    let started = Instant::now();
    let ip = client_ip(&headers);
    let mut audit = AuditRecord {
        method: "POST".to_string(),
        path: endpoint.to_string(),
        peer: fingerprint(state.audit_salt(), &ip),
        ..Default::default()
    };

    let rate = state.ip_limiter().check(&ip);
    if !rate.allowed {
        metrics::record_rate_limited("ip");
        let reply = EvalReply::Error {
            code: ErrorCode::IpRateLimit,
            message: "Too many requests from this address".to_string(),
            reset: Some(rate.reset_secs),
        };
        return render(reply, Some(&rate), &mut audit, endpoint, started);
    }

    let evaluation = tokio::time::timeout(
        state.config().request_timeout,
        evaluate(&state, &headers, &body, mutate, &mut audit),
    )
    .await;

    let reply = match evaluation {
        Ok(reply) => reply,
        Err(_) => {
            warn!(endpoint = endpoint, "Evaluation deadline exceeded");
            EvalReply::Error {
                code: ErrorCode::VerifierUnavailable,
                message: "Evaluation timed out".to_string(),
                reset: None,
            }
        }
    };
    render(reply, Some(&rate), &mut audit, endpoint, started)
}

/// The evaluation pipeline shared by /verify and /simulate
async fn evaluate(
    state: &AppState,
    headers: &HeaderMap,
    body: &str,
    mutate: bool,
    audit: &mut AuditRecord,
) -> EvalReply {
    // ===== Parse =====
    let request: VerifyRequest = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(e) => {
            return EvalReply::Error {
                code: ErrorCode::InvalidPayload,
                message: format!("invalid JSON body: {}", e),
                reset: None,
            }
        }
    };
    let token = match request.token.as_deref() {
        Some(token) if !token.is_empty() => token,
        _ => {
            return EvalReply::Error {
                code: ErrorCode::MissingToken,
                message: "token is required".to_string(),
                reset: None,
            }
        }
    };
    let ctx = match request.context {
        Some(ctx) if !ctx.action.is_empty() => ctx,
        _ => {
            return EvalReply::Error {
                code: ErrorCode::InvalidPayload,
                message: "context with an action is required".to_string(),
                reset: None,
            }
        }
    };

    // ===== Decode =====
    let decoded = match DecodedToken::decode(token) {
        Ok(decoded) => decoded,
        Err(e) => return EvalReply::err(e),
    };
    if let Err(e) = decoded.payload.validate() {
        return EvalReply::err(e);
    }
    let payload = &decoded.payload;

    audit.user = Some(fingerprint(state.audit_salt(), &payload.user));
    audit.agent = Some(fingerprint(state.audit_salt(), &payload.agent));
    if let Some(amount) = ctx.amount {
        audit.amount_band = Some(amount_band(amount));
    }

    // ===== Tenant attribution (API key wins over iss) =====
    let tenant = match state.tenant_auth().authenticate(headers) {
        Ok(Some(tenant)) => tenant,
        Ok(None) => match payload.iss.as_deref() {
            Some(iss) => Tenant::keyless(iss, state.tenant_auth().free_quotas()),
            None => {
                return EvalReply::Error {
                    code: ErrorCode::MissingIssuer,
                    message: "keyless requests require a token iss claim".to_string(),
                    reset: None,
                }
            }
        },
        Err(e) => return EvalReply::err(e),
    };
    audit.tenant = Some(tenant.id.clone());

    if let Err(denied) = state.usage().record(&tenant.id, tenant.quotas, Utc::now()) {
        metrics::record_rate_limited("tenant");
        return EvalReply::Error {
            code: ErrorCode::QuotaExceeded,
            message: format!("Tenant quota of {} requests exceeded", denied.limit),
            reset: Some(denied.reset_secs),
        };
    }

    // ===== Signature =====
    if let Err(e) = decoded.header.ensure_eddsa() {
        return EvalReply::err(e);
    }
    let kid = match decoded.header.kid.as_deref() {
        Some(kid) => kid,
        None => {
            return EvalReply::Error {
                code: ErrorCode::UnknownKid,
                message: "token header carries no kid".to_string(),
                reset: None,
            }
        }
    };
    let issuer_key = match state.jwks().resolve(kid).await {
        Some(key) => key,
        None => {
            return EvalReply::Error {
                code: ErrorCode::UnknownKid,
                message: format!("no known key for kid {}", kid),
                reset: None,
            }
        }
    };
    if let Err(e) = decoded.verify_signature(&issuer_key) {
        return EvalReply::err(e);
    }

    // ===== Claims =====
    let at = ctx.timestamp.unwrap_or_else(Utc::now);

    if payload.is_expired(at) {
        return EvalReply::err(AgentOAuthError::Expired);
    }

    if let (Some(aud), Some(expected)) = (
        payload.aud.as_deref(),
        state.config().expected_audience.as_deref(),
    ) {
        if aud != expected {
            return EvalReply::err(AgentOAuthError::AudienceMismatch {
                expected: expected.to_string(),
                actual: aud.to_string(),
            });
        }
    }

    // ===== Intent (v0.3) =====
    let mut intent_outcome = None;
    if payload.ver == TOKEN_VERSION_V03 {
        let block = match payload.intent.as_ref() {
            Some(block) => block,
            None => {
                return EvalReply::err(AgentOAuthError::InvalidPayload(
                    "act.v0.3 token is missing the intent block".to_string(),
                ))
            }
        };
        match intent::validate(block, &payload.policy_hash, at, state.intent_config()) {
            Ok(outcome) => {
                // Strict tenants reject intents that could only be
                // structurally validated
                if !outcome.verified && state.intent_strict_for(&tenant.id) {
                    return EvalReply::Deny {
                        reason: "Intent invalid: no registered authenticator key for credential"
                            .to_string(),
                        code: Some(ErrorCode::IntentInvalid),
                        simulation: !mutate,
                    };
                }
                intent_outcome = Some((outcome.verified, block.approved_at, block.valid_until));
            }
            Err(e) => {
                return EvalReply::Deny {
                    reason: e.to_string(),
                    code: Some(e.code()),
                    simulation: !mutate,
                }
            }
        }
    }

    // ===== Policy hash binding =====
    let hash_ok = decoded
        .raw_policy()
        .map(|raw| canonical::verify_hash(raw, &payload.policy_hash))
        .unwrap_or(false);
    if !hash_ok {
        return EvalReply::Deny {
            reason: "Policy hash mismatch".to_string(),
            code: Some(ErrorCode::PolicyHashMismatch),
            simulation: !mutate,
        };
    }

    // ===== Revocation =====
    match state
        .state()
        .check_revocation(&payload.jti, &payload.policy.id)
        .await
    {
        Ok(None) => {}
        Ok(Some(RevocationKind::Token)) => {
            return EvalReply::Deny {
                reason: "Token revoked".to_string(),
                code: Some(ErrorCode::Revoked),
                simulation: !mutate,
            }
        }
        Ok(Some(RevocationKind::Policy)) => {
            return EvalReply::Deny {
                reason: "Policy revoked".to_string(),
                code: Some(ErrorCode::PolicyRevoked),
                simulation: !mutate,
            }
        }
        Err(e) => {
            return EvalReply::Error {
                code: ErrorCode::VerifierUnavailable,
                message: e.to_string(),
                reset: None,
            }
        }
    }

    // ===== Stateless policy checks (authoritative denials) =====
    if let Err(deny) = policy::evaluate(&payload.policy, &ctx, at) {
        return EvalReply::Deny {
            reason: deny.reason,
            code: None,
            simulation: !mutate,
        };
    }

    // ===== Stateful checks =====
    if mutate {
        apply_and_respond(state, payload, &ctx, at, intent_outcome, audit).await
    } else {
        match state.state().simulate(payload, &ctx, at).await {
            Ok(SimulateOutcome::Allow { remaining }) => {
                let mut body = json!({
                    "decision": "ALLOW",
                    "simulation": true,
                    "policy_hash": payload.policy_hash,
                    "timestamp": at.to_rfc3339(),
                });
                if let Some(remaining) = remaining {
                    body["remaining_budget"] = json!(remaining);
                }
                EvalReply::Allow {
                    body,
                    receipt_id: None,
                }
            }
            Ok(SimulateOutcome::Deny { reason }) => EvalReply::Deny {
                reason,
                code: None,
                simulation: true,
            },
            Err(e) => EvalReply::Error {
                code: ErrorCode::VerifierUnavailable,
                message: e.to_string(),
                reset: None,
            },
        }
    }
}

/// Mutating tail of the pipeline: budget apply, receipt mint, response
async fn apply_and_respond(
    state: &AppState,
    payload: &TokenPayload,
    ctx: &RequestContext,
    at: DateTime<Utc>,
    intent_outcome: Option<(bool, DateTime<Utc>, DateTime<Utc>)>,
    audit: &mut AuditRecord,
) -> EvalReply {
    let receipt_id = ReceiptSigner::new_receipt_id();

    let outcome = match state.state().apply(payload, ctx, at, Some(&receipt_id)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(error = %e, "Apply flow failed, denying closed");
            return EvalReply::Error {
                code: ErrorCode::VerifierUnavailable,
                message: e.to_string(),
                reset: None,
            };
        }
    };

    match outcome {
        ApplyOutcome::ReplayDetected => EvalReply::Deny {
            reason: "Replay detected".to_string(),
            code: Some(ErrorCode::Replay),
            simulation: false,
        },
        ApplyOutcome::Deny { reason } => EvalReply::Deny {
            reason,
            code: None,
            simulation: false,
        },
        ApplyOutcome::Stored(stored) => replay_stored_decision(payload, at, stored),
        ApplyOutcome::Allow { remaining } => {
            let mut receipt = Receipt::allow(receipt_id.clone(), payload.policy.id.clone(), at);
            receipt.remaining = remaining.clone();
            if let Some((verified, approved_at, valid_until)) = intent_outcome {
                receipt.intent_verified = Some(verified);
                receipt.intent_approved_at = Some(approved_at);
                receipt.intent_valid_until = Some(valid_until);
            }

            // A receipt failure never turns an ALLOW into an error; the
            // audit entry records the omission instead.
            let stored_receipt = match state.receipt_signer().sign(&receipt) {
                Ok(jws) => match state.state().store_receipt(&receipt_id, &jws).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(receipt_id = %receipt_id, error = %e, "Receipt storage failed");
                        false
                    }
                },
                Err(e) => {
                    warn!(receipt_id = %receipt_id, error = %e, "Receipt signing failed");
                    false
                }
            };

            let mut body = json!({
                "decision": "ALLOW",
                "policy_hash": payload.policy_hash,
                "timestamp": at.to_rfc3339(),
            });
            if let Some(remaining) = remaining {
                body["remaining_budget"] = json!(remaining);
            }

            if stored_receipt {
                body["receipt_id"] = json!(receipt_id);
                audit.receipt_id = Some(receipt_id.clone());
                EvalReply::Allow {
                    body,
                    receipt_id: Some(receipt_id),
                }
            } else {
                metrics::record_receipt_omitted();
                audit.receipt_omitted = true;
                EvalReply::Allow {
                    body,
                    receipt_id: None,
                }
            }
        }
    }
}

/// Render a decision stored under an idempotency key, verbatim
fn replay_stored_decision(
    payload: &TokenPayload,
    at: DateTime<Utc>,
    stored: StoredDecision,
) -> EvalReply {
    debug!("Returning stored idempotent decision");
    match stored.decision {
        agentoauth_core::Decision::Allow => {
            let mut body = json!({
                "decision": "ALLOW",
                "policy_hash": payload.policy_hash,
                "timestamp": at.to_rfc3339(),
                "idempotent_replay": true,
            });
            if let Some(remaining) = stored.remaining {
                body["remaining_budget"] = json!(remaining);
            }
            if let Some(receipt_id) = stored.receipt_id.clone() {
                body["receipt_id"] = json!(receipt_id);
            }
            EvalReply::Allow {
                body,
                receipt_id: stored.receipt_id,
            }
        }
        agentoauth_core::Decision::Deny => EvalReply::Deny {
            reason: stored
                .reason
                .unwrap_or_else(|| "Denied by stored decision".to_string()),
            code: None,
            simulation: false,
        },
    }
}

// ============================================================================
// Revocation and receipts
// ============================================================================

async fn revoke(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let started = Instant::now();
    let ip = client_ip(&headers);
    let mut audit = AuditRecord {
        method: "POST".to_string(),
        path: "/revoke".to_string(),
        peer: fingerprint(state.audit_salt(), &ip),
        ..Default::default()
    };

    let rate = state.ip_limiter().check(&ip);
    if !rate.allowed {
        metrics::record_rate_limited("ip");
        let reply = EvalReply::Error {
            code: ErrorCode::IpRateLimit,
            message: "Too many requests from this address".to_string(),
            reset: Some(rate.reset_secs),
        };
        return render(reply, Some(&rate), &mut audit, "/revoke", started);
    }

    let request: RevokeRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            let reply = EvalReply::Error {
                code: ErrorCode::InvalidPayload,
                message: format!("invalid JSON body: {}", e),
                reset: None,
            };
            return render(reply, Some(&rate), &mut audit, "/revoke", started);
        }
    };

    if request.jti.is_none() && request.policy_id.is_none() {
        let reply = EvalReply::Error {
            code: ErrorCode::InvalidPayload,
            message: "provide jti or policy_id".to_string(),
            reset: None,
        };
        return render(reply, Some(&rate), &mut audit, "/revoke", started);
    }

    match state
        .state()
        .revoke(request.jti.as_deref(), request.policy_id.as_deref())
        .await
    {
        Ok(()) => {
            metrics::record_revocation();
            let body = json!({
                "revoked": true,
                "jti": request.jti,
                "policy_id": request.policy_id,
            });
            let reply = EvalReply::Allow {
                body,
                receipt_id: None,
            };
            render(reply, Some(&rate), &mut audit, "/revoke", started)
        }
        Err(e) => {
            let reply = EvalReply::Error {
                code: ErrorCode::VerifierUnavailable,
                message: e.to_string(),
                reset: None,
            };
            render(reply, Some(&rate), &mut audit, "/revoke", started)
        }
    }
}

async fn get_receipt(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(receipt_id): Path<String>,
) -> Response {
    let started = Instant::now();
    let ip = client_ip(&headers);
    let mut audit = AuditRecord {
        method: "GET".to_string(),
        path: "/receipts".to_string(),
        peer: fingerprint(state.audit_salt(), &ip),
        ..Default::default()
    };

    let rate = state.ip_limiter().check(&ip);
    if !rate.allowed {
        metrics::record_rate_limited("ip");
        let reply = EvalReply::Error {
            code: ErrorCode::IpRateLimit,
            message: "Too many requests from this address".to_string(),
            reset: Some(rate.reset_secs),
        };
        return render(reply, Some(&rate), &mut audit, "/receipts", started);
    }

    match state.state().load_receipt(&receipt_id).await {
        Ok(Some(jws)) => {
            audit.status = 200;
            audit.latency_ms = started.elapsed().as_millis() as u64;
            metrics::record_request("/receipts", 200);
            audit_log(&audit);

            let mut response = (StatusCode::OK, jws).into_response();
            response.headers_mut().insert(
                axum::http::header::CONTENT_TYPE,
                axum::http::HeaderValue::from_static("application/jwt"),
            );
            apply_rate_headers(response, &rate)
        }
        Ok(None) => {
            audit.status = 404;
            audit.latency_ms = started.elapsed().as_millis() as u64;
            metrics::record_request("/receipts", 404);
            audit_log(&audit);

            let body = json!({"error": "Receipt not found", "code": "NOT_FOUND"});
            apply_rate_headers((StatusCode::NOT_FOUND, Json(body)).into_response(), &rate)
        }
        Err(e) => {
            let reply = EvalReply::Error {
                code: ErrorCode::VerifierUnavailable,
                message: e.to_string(),
                reset: None,
            };
            render(reply, Some(&rate), &mut audit, "/receipts", started)
        }
    }
}

// ============================================================================
// Rendering helpers
// ============================================================================

/// Turn an evaluation reply into the HTTP response, recording metrics and
/// the audit entry on the way out.
fn render(
    reply: EvalReply,
    rate: Option<&RateStatus>,
    audit: &mut AuditRecord,
    endpoint: &'static str,
    started: Instant,
) -> Response {
    let (status, body, receipt_header) = match reply {
        EvalReply::Error { code, message, reset } => {
            audit.code = Some(code.as_str().to_string());
            let status = StatusCode::from_u16(code.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let mut body = json!({
                "valid": false,
                "error": message,
                "code": code.as_str(),
            });
            if let Some(suggestion) = code.suggestion() {
                body["suggestion"] = json!(suggestion);
            }
            if let Some(reset) = reset {
                body["resetTime"] = json!(reset);
            }
            (status, body, None)
        }
        EvalReply::Deny { reason, code, simulation } => {
            audit.decision = Some("DENY".to_string());
            metrics::record_decision("DENY");
            let status = code
                .map(|c| {
                    StatusCode::from_u16(c.http_status()).unwrap_or(StatusCode::FORBIDDEN)
                })
                .unwrap_or(StatusCode::FORBIDDEN);
            let mut body = json!({
                "decision": "DENY",
                "reason": reason,
            });
            if let Some(code) = code {
                audit.code = Some(code.as_str().to_string());
                body["code"] = json!(code.as_str());
            }
            if simulation {
                body["simulation"] = json!(true);
            }
            (status, body, None)
        }
        EvalReply::Allow { body, receipt_id } => {
            if body.get("decision").is_some() {
                audit.decision = Some("ALLOW".to_string());
                metrics::record_decision("ALLOW");
            }
            (StatusCode::OK, body, receipt_id)
        }
    };

    audit.status = status.as_u16();
    audit.latency_ms = started.elapsed().as_millis() as u64;
    metrics::record_request(endpoint, status.as_u16());
    metrics::record_latency(endpoint, started.elapsed().as_secs_f64());
    audit_log(audit);

    let mut response = (status, Json(body)).into_response();
    if let Some(receipt_id) = receipt_header {
        if let Ok(value) = axum::http::HeaderValue::from_str(&receipt_id) {
            response.headers_mut().insert("x-act-receipt-id", value);
        }
    }
    match rate {
        Some(rate) => apply_rate_headers(response, rate),
        None => response,
    }
}

/// Attach the `X-RateLimit-*` headers every response carries
pub(crate) fn apply_rate_headers(mut response: Response, rate: &RateStatus) -> Response {
    let headers = response.headers_mut();
    if let Ok(value) = axum::http::HeaderValue::from_str(&rate.limit.to_string()) {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = axum::http::HeaderValue::from_str(&rate.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Ok(value) = axum::http::HeaderValue::from_str(&rate.reset_secs.to_string()) {
        headers.insert("x-ratelimit-reset", value);
    }
    response
}

/// Client address as forwarded by the CDN front
pub(crate) fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
