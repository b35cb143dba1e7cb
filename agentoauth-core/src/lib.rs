//! AgentOAuth Core Library
//!
//! Pure computation for the AgentOAuth evaluator:
//! - Canonical JSON serialization and SHA-256 policy hashing
//! - Compact JWS token codec with EdDSA (Ed25519) verification
//! - WebAuthn intent validation
//! - Stateless policy evaluation (actions, resources, limits, time windows)
//! - Signed decision receipts
//!
//! Nothing in this crate performs I/O; stateful budget accounting lives in
//! `agentoauth-state` and the HTTP surface in `agentoauth-gateway`.

pub mod amount;
pub mod canonical;
pub mod error;
pub mod intent;
pub mod policy;
pub mod receipt;
pub mod token;
pub mod types;

pub use amount::Amount;
pub use error::{AgentOAuthError, ErrorCode, Result};
pub use intent::{Intent, IntentConfig, IntentOutcome};
pub use policy::{
    Constraints, Limits, Period, PerPeriodLimit, PerTxnLimit, Policy, PolicyDeny, ResourceMatch,
    ResourceRule, TimeConstraint, POLICY_VERSION,
};
pub use receipt::{Receipt, ReceiptSigner, RemainingBudget, RECEIPT_VERSION};
pub use token::{DecodedToken, JwsHeader, ALG_EDDSA};
pub use types::{
    Decision, RequestContext, ResourceRef, ScopeClaim, TokenPayload, TOKEN_VERSION_V02,
    TOKEN_VERSION_V03,
};
