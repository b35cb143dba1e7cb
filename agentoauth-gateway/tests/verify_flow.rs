//! End-to-end verification scenarios
//!
//! Drives the full router over an in-memory store with a frozen evaluation
//! clock (2025-11-05T12:00:00Z, passed through the context timestamp).
//! Run with: cargo test --test verify_flow -p agentoauth-gateway

mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::json;

// ============================================================================
// Scenario 1: within limits, v0.2
// ============================================================================

#[tokio::test]
async fn test_allow_within_limits() {
    let harness = harness();
    let payload = payload_for(&travel_policy(), "tok_scenario_01");
    let token = harness.token(&payload);

    let (status, headers, body) = harness.verify("203.0.113.1", &token, spend_context(300)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"], "ALLOW");
    assert_eq!(body["policy_hash"], payload["policy_hash"]);
    assert_eq!(body["remaining_budget"]["amount"], json!(1700));
    assert_eq!(body["remaining_budget"]["currency"], "USD");

    // Receipt issued and referenced in the header
    let receipt_id = body["receipt_id"].as_str().expect("receipt id present");
    assert!(receipt_id.starts_with("rcpt_"));
    assert_eq!(
        headers.get("x-act-receipt-id").and_then(|v| v.to_str().ok()),
        Some(receipt_id)
    );

    // Rate-limit headers on every response
    assert!(headers.contains_key("x-ratelimit-limit"));
    assert!(headers.contains_key("x-ratelimit-remaining"));
    assert!(headers.contains_key("x-ratelimit-reset"));

    // The stored receipt is a signed JWS over the decision
    let (status, headers, bytes) = harness
        .get(&format!("/receipts/{}", receipt_id), "203.0.113.1")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get("content-type").and_then(|v| v.to_str().ok()),
        Some("application/jwt")
    );
    let receipt = jws_payload(std::str::from_utf8(&bytes).unwrap());
    assert_eq!(receipt["version"], "receipt.v0.2");
    assert_eq!(receipt["decision"], "ALLOW");
    assert_eq!(receipt["policy_id"], "pol_travel");
    assert_eq!(receipt["remaining"]["amount"], json!(1700));
}

// ============================================================================
// Scenario 2: exceeds per-transaction limit
// ============================================================================

#[tokio::test]
async fn test_deny_per_txn_limit_leaves_budget_unchanged() {
    let harness = harness();
    let payload = payload_for(&travel_policy(), "tok_scenario_02");
    let token = harness.token(&payload);

    let (status, _, body) = harness.verify("203.0.113.1", &token, spend_context(700)).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["decision"], "DENY");
    assert!(body["reason"]
        .as_str()
        .unwrap()
        .contains("exceeds per-transaction limit 500 USD"));

    // No budget was charged: the full 2000 is still available
    let (status, _, body) = harness.verify("203.0.113.1", &token, spend_context(500)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remaining_budget"]["amount"], json!(1500));
}

// ============================================================================
// Scenario 3: exhausts the per-period budget
// ============================================================================

#[tokio::test]
async fn test_budget_exhaustion_and_exact_fit() {
    let harness = harness();

    // Spend 300 first
    let token = harness.token(&payload_for(&travel_policy(), "tok_scenario_3a"));
    let (status, _, _) = harness.verify("203.0.113.1", &token, spend_context(300)).await;
    assert_eq!(status, StatusCode::OK);

    // Raise the per-txn cap so the period budget is the binding limit
    let mut no_txn_cap = travel_policy();
    no_txn_cap["limits"]["per_txn"]["amount"] = json!(5000);
    let token = harness.token(&payload_for(&no_txn_cap, "tok_scenario_3b"));
    let (status, _, body) = harness.verify("203.0.113.1", &token, spend_context(1800)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["reason"]
        .as_str()
        .unwrap()
        .contains("exceeds remaining budget 1700 USD"));

    // Exactly 1700 still fits and drains the budget to zero
    let token = harness.token(&payload_for(&no_txn_cap, "tok_scenario_3c"));
    let (status, _, body) = harness.verify("203.0.113.1", &token, spend_context(1700)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remaining_budget"]["amount"], json!(0));
}

// ============================================================================
// Scenario 4: revocation shadows later use
// ============================================================================

#[tokio::test]
async fn test_revoked_token_is_denied() {
    let harness = harness();
    let payload = payload_for(&travel_policy(), "tok_scenario_04");
    let token = harness.token(&payload);

    let (status, _, _) = harness.verify("203.0.113.1", &token, spend_context(300)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = harness
        .post("/revoke", "203.0.113.1", json!({"jti": "tok_scenario_04"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked"], json!(true));

    // Revocation wins over replay for the same token
    let (status, _, body) = harness.verify("203.0.113.1", &token, spend_context(300)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["decision"], "DENY");
    assert_eq!(body["code"], "REVOKED");
    assert_eq!(body["reason"], "Token revoked");

    // revoke is idempotent
    let (status, _, body) = harness
        .post("/revoke", "203.0.113.1", json!({"jti": "tok_scenario_04"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked"], json!(true));
}

#[tokio::test]
async fn test_policy_revocation_denies_all_tokens() {
    let harness = harness();

    let (status, _, _) = harness
        .post("/revoke", "203.0.113.1", json!({"policy_id": "pol_travel"}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let token = harness.token(&payload_for(&travel_policy(), "tok_pol_rev_01"));
    let (status, _, body) = harness.verify("203.0.113.1", &token, spend_context(100)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "POLICY_REVOKED");
    assert_eq!(body["reason"], "Policy revoked");
}

// ============================================================================
// Scenario 5: intent expired (v0.3)
// ============================================================================

#[tokio::test]
async fn test_expired_intent_denied_without_budget_change() {
    let harness = harness();

    let policy = travel_policy();
    let mut payload = payload_for(&policy, "tok_scenario_05");
    payload["ver"] = json!("act.v0.3");
    let hash = payload["policy_hash"].as_str().unwrap().to_string();
    payload["intent"] = webauthn_intent(&hash, "2025-11-04T12:00:00Z");
    let token = harness.token(&payload);

    let (status, _, body) = harness.verify("203.0.113.1", &token, spend_context(300)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["decision"], "DENY");
    assert_eq!(body["code"], "INTENT_EXPIRED");

    // Nothing was charged: a fresh v0.2 token sees the full budget
    let token = harness.token(&payload_for(&policy, "tok_scenario_5b"));
    let (_, _, body) = harness.verify("203.0.113.1", &token, spend_context(300)).await;
    assert_eq!(body["remaining_budget"]["amount"], json!(1700));
}

#[tokio::test]
async fn test_valid_intent_allows_and_marks_unverified_credential() {
    let harness = harness();

    let mut payload = payload_for(&travel_policy(), "tok_intent_ok1");
    payload["ver"] = json!("act.v0.3");
    let hash = payload["policy_hash"].as_str().unwrap().to_string();
    payload["intent"] = webauthn_intent(&hash, "2025-11-05T12:30:00Z");
    let token = harness.token(&payload);

    let (status, _, body) = harness.verify("203.0.113.1", &token, spend_context(300)).await;
    assert_eq!(status, StatusCode::OK);

    // No registered authenticator key: the receipt flags the intent as
    // structurally validated only
    let receipt_id = body["receipt_id"].as_str().unwrap();
    let (_, _, bytes) = harness
        .get(&format!("/receipts/{}", receipt_id), "203.0.113.1")
        .await;
    let receipt = jws_payload(std::str::from_utf8(&bytes).unwrap());
    assert_eq!(receipt["intent_verified"], json!(false));
    assert_eq!(receipt["intent_valid_until"], "2025-11-05T12:30:00Z");
}

#[tokio::test]
async fn test_intent_policy_mismatch() {
    let harness = harness();

    let mut payload = payload_for(&travel_policy(), "tok_intent_mis1");
    payload["ver"] = json!("act.v0.3");
    let other_hash = format!("sha256:{}", "c".repeat(64));
    payload["intent"] = webauthn_intent(&other_hash, "2025-11-05T12:30:00Z");
    let token = harness.token(&payload);

    let (status, _, body) = harness.verify("203.0.113.1", &token, spend_context(300)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "INTENT_POLICY_MISMATCH");
}

// ============================================================================
// Scenario 6: policy hash mismatch
// ============================================================================

#[tokio::test]
async fn test_policy_hash_mismatch_is_denied_with_400() {
    let harness = harness();

    let mut payload = payload_for(&travel_policy(), "tok_scenario_06");
    let hash = payload["policy_hash"].as_str().unwrap().to_string();
    // Flip one hex digit; the issuer signs the altered payload, so the
    // signature itself is fine and the binding check must catch it
    let last = if hash.ends_with('0') { "1" } else { "0" };
    payload["policy_hash"] = json!(format!("{}{}", &hash[..hash.len() - 1], last));
    let token = harness.token(&payload);

    let (status, _, body) = harness.verify("203.0.113.1", &token, spend_context(300)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["decision"], "DENY");
    assert_eq!(body["code"], "POLICY_HASH_MISMATCH");
}

// ============================================================================
// Scenario 7: concurrent replay
// ============================================================================

#[tokio::test]
async fn test_concurrent_same_jti_one_winner() {
    let harness = harness();
    let token = harness.token(&payload_for(&travel_policy(), "tok_scenario_07"));

    let (a, b) = tokio::join!(
        harness.verify("203.0.113.1", &token, spend_context(100)),
        harness.verify("203.0.113.2", &token, spend_context(100)),
    );

    let statuses = [a.0, b.0];
    assert!(statuses.contains(&StatusCode::OK));
    assert!(statuses.contains(&StatusCode::FORBIDDEN));

    let denied = if a.0 == StatusCode::FORBIDDEN { &a.2 } else { &b.2 };
    assert_eq!(denied["code"], "REPLAY");
    assert_eq!(denied["reason"], "Replay detected");

    // Exactly one spend landed
    let token = harness.token(&payload_for(&travel_policy(), "tok_scenario_7b"));
    let (_, _, body) = harness.verify("203.0.113.1", &token, spend_context(100)).await;
    assert_eq!(body["remaining_budget"]["amount"], json!(1800));
}

// ============================================================================
// Simulate: identical evaluation, no mutation
// ============================================================================

#[tokio::test]
async fn test_simulate_reports_without_charging() {
    let harness = harness();
    let token = harness.token(&payload_for(&travel_policy(), "tok_sim_00001"));

    for _ in 0..3 {
        let (status, _, body) = harness.simulate("203.0.113.1", &token, spend_context(300)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["decision"], "ALLOW");
        assert_eq!(body["simulation"], json!(true));
        // Projection never moves because nothing is charged
        assert_eq!(body["remaining_budget"]["amount"], json!(1700));
    }

    let (_, _, body) = harness.simulate("203.0.113.1", &token, spend_context(9000)).await;
    assert_eq!(body["decision"], "DENY");
    assert_eq!(body["simulation"], json!(true));

    // The same token is still spendable: simulate ignored replay
    let (status, _, body) = harness.verify("203.0.113.1", &token, spend_context(300)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remaining_budget"]["amount"], json!(1700));
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn test_idempotency_key_replays_decision() {
    let harness = harness();

    let mut context = spend_context(300);
    context["idempotency_key"] = json!("order-2025-11-05-42");

    let token = harness.token(&payload_for(&travel_policy(), "tok_idem_0001"));
    let (status, _, first) = harness.verify("203.0.113.1", &token, context.clone()).await;
    assert_eq!(status, StatusCode::OK);

    // Re-issued token, same idempotency key: original decision verbatim,
    // budget untouched
    let token = harness.token(&payload_for(&travel_policy(), "tok_idem_0002"));
    let (status, _, second) = harness.verify("203.0.113.1", &token, context).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["idempotent_replay"], json!(true));
    assert_eq!(second["receipt_id"], first["receipt_id"]);
    assert_eq!(second["remaining_budget"]["amount"], json!(1700));

    let token = harness.token(&payload_for(&travel_policy(), "tok_idem_0003"));
    let (_, _, body) = harness.verify("203.0.113.1", &token, spend_context(100)).await;
    assert_eq!(body["remaining_budget"]["amount"], json!(1600));
}
