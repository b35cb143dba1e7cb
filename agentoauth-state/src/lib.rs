//! AgentOAuth State Manager
//!
//! Stateful half of the evaluator: period-aligned budget accounting, replay
//! exclusion, idempotency, revocations, and receipt persistence. Built on
//! the `agentoauth-store` key-value contract; this crate is the only writer
//! of the `budget:`, `replay:`, `idem:`, `rev:` and `rcpt:` namespaces.

pub mod error;
pub mod manager;
pub mod period;

pub use error::{Result, StateError};
pub use manager::{
    ApplyOutcome, RevocationKind, SimulateOutcome, StateManager, StoredDecision,
};
