//! State manager
//!
//! Exclusive owner of all mutating evaluator state, across four namespaces:
//! `budget:` (per-period spend), `replay:` (used jtis), `idem:` (stored
//! decisions), `rev:` (revocations), plus `rcpt:` for signed receipts.
//!
//! Budget increments run as bounded compare-and-set loops so a key is
//! effectively single-flighted; spent values only ever grow, and reset only
//! by crossing into a new aligned period.

use crate::error::{Result, StateError};
use crate::period;
use agentoauth_core::{
    Amount, Decision, Period, PerPeriodLimit, RemainingBudget, RequestContext, TokenPayload,
};
use agentoauth_store::KvStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded retries for budget compare-and-set
const MAX_CAS_ATTEMPTS: u32 = 16;

/// Idempotency entries live for one hour
const IDEMPOTENCY_TTL: Duration = Duration::from_secs(3600);

/// Revocations shadow any later acceptance for at least a year
const REVOCATION_TTL: Duration = Duration::from_secs(365 * 24 * 3600);

/// Receipts stay retrievable for the audit window
const RECEIPT_TTL: Duration = Duration::from_secs(400 * 24 * 3600);

/// What a revocation entry was keyed by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationKind {
    Token,
    Policy,
}

/// A decision persisted under an idempotency key and replayed verbatim
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDecision {
    pub decision: Decision,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<RemainingBudget>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,
}

/// Outcome of the mutating apply flow
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    /// Evaluation may proceed to ALLOW; budget (if any) has been charged
    Allow { remaining: Option<RemainingBudget> },

    /// This jti has already been used
    ReplayDetected,

    /// Budget or currency rejection; nothing was charged
    Deny { reason: String },

    /// A prior decision was found under the idempotency key
    Stored(StoredDecision),
}

/// Outcome of the read-only simulate flow
#[derive(Debug, Clone)]
pub enum SimulateOutcome {
    Allow { remaining: Option<RemainingBudget> },
    Deny { reason: String },
}

/// Shared result shape for the charging and projecting budget paths; for
/// `charge_budget` an `Allow` means the increment happened.
enum BudgetCheck {
    NotApplicable,
    Deny { reason: String },
    Allow { remaining: RemainingBudget },
}

/// Owns all mutating state on behalf of the evaluator
pub struct StateManager {
    store: Arc<dyn KvStore>,
}

impl StateManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    // ===== Revocation =====

    /// Look up revocation entries for a token and its policy. Token
    /// revocation wins when both are present.
    pub async fn check_revocation(
        &self,
        jti: &str,
        policy_id: &str,
    ) -> Result<Option<RevocationKind>> {
        if self.store.get(&revocation_jti_key(jti)).await?.is_some() {
            return Ok(Some(RevocationKind::Token));
        }
        if self.store.get(&revocation_policy_key(policy_id)).await?.is_some() {
            return Ok(Some(RevocationKind::Policy));
        }
        Ok(None)
    }

    /// Write revocation entries. Idempotent; repeated calls are harmless.
    pub async fn revoke(&self, jti: Option<&str>, policy_id: Option<&str>) -> Result<()> {
        let stamp = Utc::now().to_rfc3339();
        if let Some(jti) = jti {
            self.store
                .put(&revocation_jti_key(jti), &stamp, Some(REVOCATION_TTL))
                .await?;
            debug!(jti = %jti, "Token revoked");
        }
        if let Some(policy_id) = policy_id {
            self.store
                .put(&revocation_policy_key(policy_id), &stamp, Some(REVOCATION_TTL))
                .await?;
            debug!(policy_id = %policy_id, "Policy revoked");
        }
        Ok(())
    }

    // ===== Apply (mutating) =====

    /// Run the stateful apply flow: replay exclusion, idempotency lookup,
    /// then atomic budget accounting.
    ///
    /// `receipt_id` is the id the caller will mint a receipt under if this
    /// returns `Allow`; it is folded into the stored idempotent decision.
    pub async fn apply(
        &self,
        payload: &TokenPayload,
        ctx: &RequestContext,
        at: DateTime<Utc>,
        receipt_id: Option<&str>,
    ) -> Result<ApplyOutcome> {
        // Step 1: at-most-one winner per jti
        let replay_ttl = replay_ttl(payload.exp, at);
        let fresh = self
            .store
            .put_if_absent(&replay_key(&payload.jti), &at.to_rfc3339(), Some(replay_ttl))
            .await?;
        if !fresh {
            debug!(jti = %payload.jti, "Replay detected");
            return Ok(ApplyOutcome::ReplayDetected);
        }

        // Step 2: idempotent retries observe the original decision
        if let Some(key) = ctx.idempotency_key.as_deref() {
            if let Some(raw) = self.store.get(&idempotency_key(key)).await? {
                let stored: StoredDecision =
                    serde_json::from_str(&raw).map_err(|e| StateError::Corrupt {
                        key: idempotency_key(key),
                        message: e.to_string(),
                    })?;
                debug!(idempotency_key = %key, "Idempotency hit");
                return Ok(ApplyOutcome::Stored(stored));
            }
        }

        // Steps 3-5: budget accounting
        match self.charge_budget(payload, ctx, at).await? {
            BudgetCheck::NotApplicable => Ok(ApplyOutcome::Allow { remaining: None }),
            BudgetCheck::Deny { reason } => {
                if let Some(key) = ctx.idempotency_key.as_deref() {
                    self.record_decision(
                        key,
                        &StoredDecision {
                            decision: Decision::Deny,
                            reason: Some(reason.clone()),
                            remaining: None,
                            receipt_id: None,
                        },
                    )
                    .await?;
                }
                Ok(ApplyOutcome::Deny { reason })
            }
            BudgetCheck::Allow { remaining } => {
                // Step 6: persist the success decision for retries
                if let Some(key) = ctx.idempotency_key.as_deref() {
                    self.record_decision(
                        key,
                        &StoredDecision {
                            decision: Decision::Allow,
                            reason: None,
                            remaining: Some(remaining.clone()),
                            receipt_id: receipt_id.map(str::to_string),
                        },
                    )
                    .await?;
                }
                Ok(ApplyOutcome::Allow {
                    remaining: Some(remaining),
                })
            }
        }
    }

    /// Read-only twin of `apply`: reports the theoretical outcome without
    /// touching replay, idempotency, or budget state.
    pub async fn simulate(
        &self,
        payload: &TokenPayload,
        ctx: &RequestContext,
        at: DateTime<Utc>,
    ) -> Result<SimulateOutcome> {
        match self.project_budget(payload, ctx, at).await? {
            BudgetCheck::NotApplicable => Ok(SimulateOutcome::Allow { remaining: None }),
            BudgetCheck::Deny { reason } => Ok(SimulateOutcome::Deny { reason }),
            BudgetCheck::Allow { remaining } => Ok(SimulateOutcome::Allow {
                remaining: Some(remaining),
            }),
        }
    }

    // ===== Receipts =====

    pub async fn store_receipt(&self, receipt_id: &str, jws: &str) -> Result<()> {
        self.store
            .put(&receipt_key(receipt_id), jws, Some(RECEIPT_TTL))
            .await?;
        Ok(())
    }

    pub async fn load_receipt(&self, receipt_id: &str) -> Result<Option<String>> {
        Ok(self.store.get(&receipt_key(receipt_id)).await?)
    }

    // ===== Internals =====

    async fn record_decision(&self, key: &str, decision: &StoredDecision) -> Result<()> {
        let raw = serde_json::to_string(decision).map_err(|e| StateError::Corrupt {
            key: idempotency_key(key),
            message: e.to_string(),
        })?;
        self.store
            .put(&idempotency_key(key), &raw, Some(IDEMPOTENCY_TTL))
            .await?;
        Ok(())
    }

    /// Charge the per-period budget with a bounded CAS loop
    async fn charge_budget(
        &self,
        payload: &TokenPayload,
        ctx: &RequestContext,
        at: DateTime<Utc>,
    ) -> Result<BudgetCheck> {
        let (amount, limit) = match budget_inputs(payload, ctx) {
            Some(inputs) => inputs,
            None => return Ok(BudgetCheck::NotApplicable),
        };
        if let Some(reason) = currency_mismatch(ctx, limit) {
            return Ok(BudgetCheck::Deny { reason });
        }

        let key = budget_key(&payload.policy.id, limit.period, at);
        let ttl = budget_ttl(limit.period, at);

        for attempt in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get(&key).await?;
            let spent = parse_spent(&key, current.as_deref())?;

            let next = match spent.checked_add(amount) {
                Some(next) if next <= limit.amount => next,
                _ => {
                    let remaining = limit.amount.saturating_sub(spent);
                    return Ok(BudgetCheck::Deny {
                        reason: format!(
                            "Amount {} {} exceeds remaining budget {} {}",
                            amount, limit.currency, remaining, limit.currency
                        ),
                    });
                }
            };

            if self
                .store
                .compare_and_set(&key, current.as_deref(), &next.to_string(), Some(ttl))
                .await?
            {
                debug!(key = %key, spent = %next, "Budget charged");
                return Ok(BudgetCheck::Allow {
                    remaining: RemainingBudget {
                        amount: limit.amount.saturating_sub(next),
                        currency: limit.currency.clone(),
                        period_ends: period::period_end(limit.period, at),
                    },
                });
            }

            debug!(key = %key, attempt = attempt, "Budget CAS conflict, retrying");
        }

        warn!(key = %key, "Budget CAS retries exhausted");
        Err(StateError::Contention(key))
    }

    /// Read the budget and project the outcome without writing
    async fn project_budget(
        &self,
        payload: &TokenPayload,
        ctx: &RequestContext,
        at: DateTime<Utc>,
    ) -> Result<BudgetCheck> {
        let (amount, limit) = match budget_inputs(payload, ctx) {
            Some(inputs) => inputs,
            None => return Ok(BudgetCheck::NotApplicable),
        };
        if let Some(reason) = currency_mismatch(ctx, limit) {
            return Ok(BudgetCheck::Deny { reason });
        }

        let key = budget_key(&payload.policy.id, limit.period, at);
        let spent = parse_spent(&key, self.store.get(&key).await?.as_deref())?;

        match spent.checked_add(amount) {
            Some(next) if next <= limit.amount => Ok(BudgetCheck::Allow {
                remaining: RemainingBudget {
                    amount: limit.amount.saturating_sub(next),
                    currency: limit.currency.clone(),
                    period_ends: period::period_end(limit.period, at),
                },
            }),
            _ => {
                let remaining = limit.amount.saturating_sub(spent);
                Ok(BudgetCheck::Deny {
                    reason: format!(
                        "Amount {} {} exceeds remaining budget {} {}",
                        amount, limit.currency, remaining, limit.currency
                    ),
                })
            }
        }
    }
}

fn budget_inputs<'a>(
    payload: &'a TokenPayload,
    ctx: &RequestContext,
) -> Option<(Amount, &'a PerPeriodLimit)> {
    let amount = ctx.amount?;
    let limit = payload.policy.limits.as_ref()?.per_period.as_ref()?;
    Some((amount, limit))
}

fn currency_mismatch(ctx: &RequestContext, limit: &PerPeriodLimit) -> Option<String> {
    match ctx.currency.as_deref() {
        Some(c) if c == limit.currency => None,
        Some(c) => Some(format!(
            "Currency {} does not match limit currency {}",
            c, limit.currency
        )),
        None => Some(format!("Currency missing: limit requires {}", limit.currency)),
    }
}

fn parse_spent(key: &str, raw: Option<&str>) -> Result<Amount> {
    match raw {
        None => Ok(Amount::ZERO),
        Some(raw) => Amount::from_str(raw).map_err(|e| StateError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

fn replay_ttl(exp: i64, at: DateTime<Utc>) -> Duration {
    let secs = exp.saturating_sub(at.timestamp()).max(1);
    Duration::from_secs(secs as u64)
}

fn budget_ttl(period: Period, at: DateTime<Utc>) -> Duration {
    // One full period past the window end, so late readers still see the
    // closing balance
    let until_end = period::period_end(period, at) - at;
    let extra = period::span(period);
    Duration::from_secs((until_end + extra).num_seconds().max(1) as u64)
}

fn budget_key(policy_id: &str, period: Period, at: DateTime<Utc>) -> String {
    format!(
        "budget:{}:{}:{}",
        policy_id,
        period,
        period::aligned_id(period, at)
    )
}

fn replay_key(jti: &str) -> String {
    format!("replay:{}", jti)
}

fn idempotency_key(key: &str) -> String {
    format!("idem:{}", key)
}

fn revocation_jti_key(jti: &str) -> String {
    format!("rev:jti:{}", jti)
}

fn revocation_policy_key(policy_id: &str) -> String {
    format!("rev:pol:{}", policy_id)
}

fn receipt_key(receipt_id: &str) -> String {
    format!("rcpt:{}", receipt_id)
}
