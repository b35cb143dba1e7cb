//! Shared test harness for gateway integration tests
//!
//! Builds the full router over an in-memory store, with a throwaway issuer
//! key registered under a fixed kid, and mints signed tokens for it. All
//! scenarios evaluate at a frozen instant passed through the request
//! context timestamp.

#![allow(dead_code)]

use agentoauth_core::token::{sign_compact, JwsHeader};
use agentoauth_core::{canonical, IntentConfig};
use agentoauth_gateway::{router, AppState, GatewayConfig};
use agentoauth_store::MemoryStore;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey};
use http_body_util::BodyExt;
use rand::rngs::OsRng;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tower::util::ServiceExt;

pub const ISSUER_KID: &str = "issuer-key-1";
pub const RP_ID: &str = "agentoauth.example";
pub const FROZEN_NOW: &str = "2025-11-05T12:00:00Z";
pub const API_KEY_SECRET: &str = "integration-api-key-secret";

pub fn frozen_now() -> DateTime<Utc> {
    FROZEN_NOW.parse().expect("frozen clock parses")
}

pub struct TestHarness {
    pub app: Router,
    pub state: Arc<AppState>,
    pub issuer_key: SigningKey,
    pub store: Arc<MemoryStore>,
}

pub fn harness() -> TestHarness {
    harness_with(GatewayConfig {
        rp_id: RP_ID.to_string(),
        audit_salt: Some("test-salt".to_string()),
        api_key_secret: Some(API_KEY_SECRET.to_string()),
        ..GatewayConfig::default()
    })
}

pub fn harness_with(config: GatewayConfig) -> TestHarness {
    let store = Arc::new(MemoryStore::new());
    let state = Arc::new(
        AppState::with_store(config, store.clone())
            .with_intent_config(IntentConfig::new(RP_ID)),
    );

    let issuer_key = SigningKey::generate(&mut OsRng);
    state.add_issuer_key(ISSUER_KID, issuer_key.verifying_key());

    TestHarness {
        app: router(state.clone()),
        state,
        issuer_key,
        store,
    }
}

/// Policy P1 from the end-to-end scenarios: payments.send to airbnb,
/// 500 USD per transaction, 2000 USD per ISO week
pub fn travel_policy() -> Value {
    json!({
        "version": "pol.v0.2",
        "id": "pol_travel",
        "actions": ["payments.send"],
        "resources": [
            {"type": "merchant", "match": {"ids": ["airbnb"]}}
        ],
        "limits": {
            "per_txn": {"amount": 500, "currency": "USD"},
            "per_period": {"amount": 2000, "currency": "USD", "period": "week"}
        }
    })
}

/// A v0.2 payload over `policy`, expiring 7 days after the frozen clock
pub fn payload_for(policy: &Value, jti: &str) -> Value {
    json!({
        "ver": "act.v0.2",
        "jti": jti,
        "user": "user_alice",
        "agent": "agent_shopper",
        "scope": ["payments.send"],
        "iss": "issuer.example",
        "exp": frozen_now().timestamp() + 7 * 86_400,
        "nonce": "b9d2f8a41c6e03d7",
        "policy": policy,
        "policy_hash": canonical::hash(policy).expect("policy hashes"),
    })
}

/// A request context at the frozen clock
pub fn spend_context(amount: i64) -> Value {
    json!({
        "action": "payments.send",
        "resource": {"type": "merchant", "id": "airbnb"},
        "amount": amount,
        "currency": "USD",
        "timestamp": FROZEN_NOW,
    })
}

/// A structurally complete WebAuthn intent over `policy_hash`, signed by a
/// throwaway authenticator key (not registered with the harness)
pub fn webauthn_intent(policy_hash: &str, valid_until: &str) -> Value {
    let authenticator = SigningKey::generate(&mut OsRng);
    let client_data = json!({
        "type": "webauthn.get",
        "challenge": URL_SAFE_NO_PAD.encode(policy_hash.as_bytes()),
        "origin": format!("https://{}", RP_ID),
    });
    let client_data_bytes = serde_json::to_vec(&client_data).expect("client data serializes");

    let mut auth_data = Sha256::digest(RP_ID.as_bytes()).to_vec();
    auth_data.push(0x01);
    auth_data.extend_from_slice(&[0, 0, 0, 9]);

    let mut message = auth_data.clone();
    message.extend_from_slice(&Sha256::digest(&client_data_bytes));
    let signature = authenticator.sign(&message);

    json!({
        "type": "webauthn.v0",
        "credential_id": URL_SAFE_NO_PAD.encode(b"cred-test-1"),
        "signature": URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        "client_data_json": URL_SAFE_NO_PAD.encode(&client_data_bytes),
        "authenticator_data": URL_SAFE_NO_PAD.encode(&auth_data),
        "approved_at": "2025-11-05T11:30:00Z",
        "valid_until": valid_until,
        "challenge": policy_hash,
        "rp_id": RP_ID,
    })
}

impl TestHarness {
    /// Sign a payload with the harness issuer key
    pub fn token(&self, payload: &Value) -> String {
        sign_compact(&JwsHeader::eddsa(ISSUER_KID), payload, &self.issuer_key)
            .expect("token signs")
    }

    pub async fn post(&self, path: &str, ip: &str, body: Value) -> (StatusCode, HeaderMap, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .header("x-forwarded-for", ip)
            .body(Body::from(body.to_string()))
            .expect("request builds");

        let response = self.app.clone().oneshot(request).await.expect("handler runs");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.expect("body reads").to_bytes();
        let body: Value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, headers, body)
    }

    pub async fn get(&self, path: &str, ip: &str) -> (StatusCode, HeaderMap, Vec<u8>) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .expect("request builds");

        let response = self.app.clone().oneshot(request).await.expect("handler runs");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.expect("body reads").to_bytes();
        (status, headers, bytes.to_vec())
    }

    pub async fn verify(&self, ip: &str, token: &str, context: Value) -> (StatusCode, HeaderMap, Value) {
        self.post("/verify", ip, json!({"token": token, "context": context}))
            .await
    }

    pub async fn simulate(&self, ip: &str, token: &str, context: Value) -> (StatusCode, HeaderMap, Value) {
        self.post("/simulate", ip, json!({"token": token, "context": context}))
            .await
    }
}

/// Decode the payload segment of a compact JWS
pub fn jws_payload(jws: &str) -> Value {
    let segment = jws.split('.').nth(1).expect("three segments");
    let bytes = URL_SAFE_NO_PAD.decode(segment).expect("valid base64url");
    serde_json::from_slice(&bytes).expect("payload is JSON")
}
