//! Policy model and the stateless evaluation engine
//!
//! Checks run in a fixed order (action, resource, per-transaction limit,
//! time window) and the first failure wins. Reasons are stable strings
//! suitable for auditing. Stateless failures are authoritative denials;
//! callers must not proceed to stateful checks after one.

use crate::amount::Amount;
use crate::error::{AgentOAuthError, Result};
use crate::types::{RequestContext, ResourceRef};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Policy schema version understood by this engine
pub const POLICY_VERSION: &str = "pol.v0.2";

/// Structured authorization contract embedded in a token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub version: String,

    /// Opaque policy identifier; budget accounting is keyed by it
    pub id: String,

    /// Action names the delegate may perform; never empty
    pub actions: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceRule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<Limits>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,

    /// When true, unknown policy fields are a lint failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,

    /// Fields this engine does not understand; kept for linting and
    /// strict-mode enforcement
    #[serde(flatten)]
    pub unknown: serde_json::Map<String, Value>,
}

/// One allowed resource shape: `type` must match and the id must be in
/// `ids` or extend one of `prefixes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRule {
    #[serde(rename = "type")]
    pub resource_type: String,

    #[serde(rename = "match")]
    pub matcher: ResourceMatch,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefixes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_txn: Option<PerTxnLimit>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_period: Option<PerPeriodLimit>,
}

/// Hard cap on a single transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerTxnLimit {
    pub amount: Amount,
    pub currency: String,
}

/// Budget over an aligned UTC period window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerPeriodLimit {
    pub amount: Amount,
    pub currency: String,
    pub period: Period,
}

/// Accounting window granularity; alignment is always UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Hour,
    Day,
    Week,
    Month,
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Period::Hour => f.write_str("hour"),
            Period::Day => f.write_str("day"),
            Period::Week => f.write_str("week"),
            Period::Month => f.write_str("month"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeConstraint>,
}

/// Allowed day-of-week set and an inclusive HH:MM window.
///
/// Evaluated against UTC; `tz` is accepted in the schema but timezone
/// conversion is a deferred enhancement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeConstraint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dow: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
}

impl Policy {
    /// Structural validation; evaluation assumes this has passed.
    pub fn validate(&self) -> Result<()> {
        if self.version != POLICY_VERSION {
            return Err(AgentOAuthError::PolicyError(format!(
                "unsupported policy version: {}",
                self.version
            )));
        }
        if self.id.is_empty() {
            return Err(AgentOAuthError::PolicyError("policy id is required".to_string()));
        }
        if self.actions.is_empty() {
            return Err(AgentOAuthError::PolicyError(
                "policy must permit at least one action".to_string(),
            ));
        }
        for rule in &self.resources {
            if rule.resource_type.is_empty() {
                return Err(AgentOAuthError::PolicyError(
                    "resource entry is missing a type".to_string(),
                ));
            }
        }
        if let Some(limits) = &self.limits {
            if let Some(per_txn) = &limits.per_txn {
                if per_txn.amount.is_negative() || per_txn.currency.is_empty() {
                    return Err(AgentOAuthError::PolicyError(
                        "per_txn limit requires a non-negative amount and a currency".to_string(),
                    ));
                }
            }
            if let Some(per_period) = &limits.per_period {
                if per_period.amount.is_negative() || per_period.currency.is_empty() {
                    return Err(AgentOAuthError::PolicyError(
                        "per_period limit requires a non-negative amount and a currency"
                            .to_string(),
                    ));
                }
            }
        }
        if let Some(time) = self.constraints.as_ref().and_then(|c| c.time.as_ref()) {
            for field in [&time.start, &time.end].into_iter().flatten() {
                if !is_hh_mm(field) {
                    return Err(AgentOAuthError::PolicyError(format!(
                        "time window bound must be HH:MM, got {}",
                        field
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether the policy carries no monetary limits at all
    pub fn is_shape_only(&self) -> bool {
        match &self.limits {
            None => true,
            Some(limits) => limits.per_txn.is_none() && limits.per_period.is_none(),
        }
    }
}

fn is_hh_mm(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return false;
    }
    let hh = &s[..2];
    let mm = &s[3..];
    matches!(hh.parse::<u8>(), Ok(h) if h < 24) && matches!(mm.parse::<u8>(), Ok(m) if m < 60)
}

/// An authoritative stateless denial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDeny {
    pub reason: String,
}

impl PolicyDeny {
    fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Run the stateless checks in order; first failure wins.
pub fn evaluate(
    policy: &Policy,
    ctx: &RequestContext,
    at: DateTime<Utc>,
) -> std::result::Result<(), PolicyDeny> {
    check_action(policy, &ctx.action)?;
    if let Some(resource) = &ctx.resource {
        check_resource(policy, resource)?;
    }
    if let Some(amount) = ctx.amount {
        if let Some(per_txn) = policy.limits.as_ref().and_then(|l| l.per_txn.as_ref()) {
            check_per_txn(per_txn, amount, ctx.currency.as_deref())?;
        }
    }
    if let Some(time) = policy.constraints.as_ref().and_then(|c| c.time.as_ref()) {
        check_time(time, at)?;
    }
    Ok(())
}

fn check_action(policy: &Policy, action: &str) -> std::result::Result<(), PolicyDeny> {
    if policy.actions.iter().any(|a| a == action) {
        Ok(())
    } else {
        Err(PolicyDeny::new(format!("Action '{}' not permitted", action)))
    }
}

fn check_resource(policy: &Policy, resource: &ResourceRef) -> std::result::Result<(), PolicyDeny> {
    let matched = policy.resources.iter().any(|rule| {
        if rule.resource_type != resource.resource_type {
            return false;
        }
        let by_id = rule
            .matcher
            .ids
            .as_ref()
            .is_some_and(|ids| ids.iter().any(|id| id == &resource.id));
        let by_prefix = rule
            .matcher
            .prefixes
            .as_ref()
            .is_some_and(|prefixes| prefixes.iter().any(|p| resource.id.starts_with(p.as_str())));
        by_id || by_prefix
    });

    if matched {
        Ok(())
    } else {
        Err(PolicyDeny::new(format!(
            "Resource '{}:{}' not allowed",
            resource.resource_type, resource.id
        )))
    }
}

fn check_per_txn(
    limit: &PerTxnLimit,
    amount: Amount,
    currency: Option<&str>,
) -> std::result::Result<(), PolicyDeny> {
    match currency {
        Some(c) if c == limit.currency => {}
        Some(c) => {
            return Err(PolicyDeny::new(format!(
                "Currency {} does not match limit currency {}",
                c, limit.currency
            )))
        }
        None => {
            return Err(PolicyDeny::new(format!(
                "Currency missing: limit requires {}",
                limit.currency
            )))
        }
    }

    if amount > limit.amount {
        return Err(PolicyDeny::new(format!(
            "Amount {} {} exceeds per-transaction limit {} {}",
            amount, limit.currency, limit.amount, limit.currency
        )));
    }
    Ok(())
}

fn check_time(time: &TimeConstraint, at: DateTime<Utc>) -> std::result::Result<(), PolicyDeny> {
    if let Some(dow) = &time.dow {
        if !dow.is_empty() {
            let today = at.weekday().to_string();
            if !dow.iter().any(|d| d.eq_ignore_ascii_case(&today)) {
                return Err(PolicyDeny::new("Outside allowed days"));
            }
        }
    }

    if let (Some(start), Some(end)) = (&time.start, &time.end) {
        let hh_mm = format!("{:02}:{:02}", at.hour(), at.minute());
        // Lexicographic order is chronological for zero-padded HH:MM
        if hh_mm.as_str() < start.as_str() || hh_mm.as_str() > end.as_str() {
            return Err(PolicyDeny::new(format!(
                "Outside allowed hours {}-{}",
                start, end
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn travel_policy() -> Policy {
        serde_json::from_value(json!({
            "version": "pol.v0.2",
            "id": "pol_travel",
            "actions": ["payments.send"],
            "resources": [
                {"type": "merchant", "match": {"ids": ["airbnb"], "prefixes": ["trip_"]}}
            ],
            "limits": {
                "per_txn": {"amount": 500, "currency": "USD"},
                "per_period": {"amount": 2000, "currency": "USD", "period": "week"}
            }
        }))
        .unwrap()
    }

    fn ctx(action: &str) -> RequestContext {
        RequestContext {
            action: action.to_string(),
            ..Default::default()
        }
    }

    fn wednesday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 5, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_action_not_permitted() {
        let deny = evaluate(&travel_policy(), &ctx("files.delete"), wednesday_noon()).unwrap_err();
        assert_eq!(deny.reason, "Action 'files.delete' not permitted");
    }

    #[test]
    fn test_resource_by_id_and_prefix() {
        let policy = travel_policy();
        let mut context = ctx("payments.send");

        context.resource = Some(ResourceRef {
            resource_type: "merchant".to_string(),
            id: "airbnb".to_string(),
        });
        evaluate(&policy, &context, wednesday_noon()).unwrap();

        context.resource = Some(ResourceRef {
            resource_type: "merchant".to_string(),
            id: "trip_9981".to_string(),
        });
        evaluate(&policy, &context, wednesday_noon()).unwrap();

        context.resource = Some(ResourceRef {
            resource_type: "merchant".to_string(),
            id: "uber".to_string(),
        });
        let deny = evaluate(&policy, &context, wednesday_noon()).unwrap_err();
        assert_eq!(deny.reason, "Resource 'merchant:uber' not allowed");

        // Type must match even when the id would
        context.resource = Some(ResourceRef {
            resource_type: "dataset".to_string(),
            id: "airbnb".to_string(),
        });
        assert!(evaluate(&policy, &context, wednesday_noon()).is_err());
    }

    #[test]
    fn test_per_txn_limit() {
        let policy = travel_policy();
        let mut context = ctx("payments.send");
        context.amount = Some(Amount::from(700));
        context.currency = Some("USD".to_string());

        let deny = evaluate(&policy, &context, wednesday_noon()).unwrap_err();
        assert_eq!(
            deny.reason,
            "Amount 700 USD exceeds per-transaction limit 500 USD"
        );

        context.amount = Some(Amount::from(500));
        evaluate(&policy, &context, wednesday_noon()).unwrap();
    }

    #[test]
    fn test_currency_mismatch() {
        let policy = travel_policy();
        let mut context = ctx("payments.send");
        context.amount = Some(Amount::from(10));
        context.currency = Some("EUR".to_string());

        let deny = evaluate(&policy, &context, wednesday_noon()).unwrap_err();
        assert_eq!(deny.reason, "Currency EUR does not match limit currency USD");

        context.currency = None;
        let deny = evaluate(&policy, &context, wednesday_noon()).unwrap_err();
        assert_eq!(deny.reason, "Currency missing: limit requires USD");
    }

    #[test]
    fn test_missing_amount_skips_monetary_checks() {
        let policy = travel_policy();
        let mut context = ctx("payments.send");
        context.currency = None;
        evaluate(&policy, &context, wednesday_noon()).unwrap();
    }

    #[test]
    fn test_time_window() {
        let mut policy = travel_policy();
        policy.constraints = Some(Constraints {
            time: Some(TimeConstraint {
                dow: Some(vec!["Mon".into(), "Wed".into(), "Fri".into()]),
                start: Some("09:00".into()),
                end: Some("17:00".into()),
                tz: None,
            }),
        });
        let context = ctx("payments.send");

        // 2025-11-05 is a Wednesday
        evaluate(&policy, &context, wednesday_noon()).unwrap();

        let sunday = Utc.with_ymd_and_hms(2025, 11, 9, 12, 0, 0).unwrap();
        let deny = evaluate(&policy, &context, sunday).unwrap_err();
        assert_eq!(deny.reason, "Outside allowed days");

        let late = Utc.with_ymd_and_hms(2025, 11, 5, 17, 1, 0).unwrap();
        let deny = evaluate(&policy, &context, late).unwrap_err();
        assert_eq!(deny.reason, "Outside allowed hours 09:00-17:00");

        // Window bounds are inclusive
        let at_end = Utc.with_ymd_and_hms(2025, 11, 5, 17, 0, 0).unwrap();
        evaluate(&policy, &context, at_end).unwrap();
    }

    #[test]
    fn test_first_failure_wins() {
        let policy = travel_policy();
        let mut context = ctx("files.delete");
        context.amount = Some(Amount::from(9999));
        context.currency = Some("EUR".to_string());

        // Action failure reported even though monetary checks would fail too
        let deny = evaluate(&policy, &context, wednesday_noon()).unwrap_err();
        assert_eq!(deny.reason, "Action 'files.delete' not permitted");
    }

    #[test]
    fn test_shape_only_policy() {
        let policy: Policy = serde_json::from_value(json!({
            "version": "pol.v0.2",
            "id": "pol_shape",
            "actions": ["calendar.read"]
        }))
        .unwrap();
        assert!(policy.is_shape_only());
        evaluate(&policy, &ctx("calendar.read"), wednesday_noon()).unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_structures() {
        let empty_actions: Policy = serde_json::from_value(json!({
            "version": "pol.v0.2",
            "id": "p",
            "actions": []
        }))
        .unwrap();
        assert!(empty_actions.validate().is_err());

        let wrong_version: Policy = serde_json::from_value(json!({
            "version": "pol.v9",
            "id": "p",
            "actions": ["a"]
        }))
        .unwrap();
        assert!(wrong_version.validate().is_err());

        let bad_window: Policy = serde_json::from_value(json!({
            "version": "pol.v0.2",
            "id": "p",
            "actions": ["a"],
            "constraints": {"time": {"start": "9am", "end": "17:00"}}
        }))
        .unwrap();
        assert!(bad_window.validate().is_err());
    }

    #[test]
    fn test_unknown_fields_are_preserved() {
        let policy: Policy = serde_json::from_value(json!({
            "version": "pol.v0.2",
            "id": "p",
            "actions": ["a"],
            "max_delegation_depth": 3
        }))
        .unwrap();
        assert!(policy.unknown.contains_key("max_delegation_depth"));
    }
}
