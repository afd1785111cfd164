//! Upto session engine.
//!
//! A session tracks one capped permit across many metered charges: the
//! [`store`] keeps per-session state with atomic mutations, the
//! [`orchestrator`] drives a session through settlement against a
//! facilitator, the [`sweeper`] triggers batched settlements in the
//! background, and the [`manager`] is the front door that admits charges
//! and explicit closes.

pub mod manager;
pub mod orchestrator;
pub mod store;
pub mod sweeper;

pub use manager::{ChargeError, UptoConfig, UptoSessionManager};
pub use orchestrator::settle_upto_session;
pub use store::{AccrueError, SessionStore, TransitionError};
pub use sweeper::{SweeperConfig, UptoSweeper};

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

use crate::proto::{PaymentPayload, PaymentRequirements, SettleResponse};
use crate::timestamp::UnixTimestamp;

/// Opaque session identifier, merchant-chosen or facilitator-minted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Mints a fresh time-ordered identifier.
    pub fn mint() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Session lifecycle state.
///
/// `Closed` is terminal. `Settling` excludes every other settlement attempt
/// for the same session; the `open → settling` transition is the per-session
/// settlement lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Settling,
    Closed,
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Open => write!(f, "open"),
            SessionStatus::Settling => write!(f, "settling"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Record of the most recent settlement attempt on a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementRecord {
    pub at_ms: u64,
    pub reason: String,
    pub receipt: SettleResponse,
}

/// Server-side state of one upto session.
///
/// Holds the invariant `settled_total + pending_spent <= cap` at every
/// observable state; the store's mutators are the only writers.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub payment_payload: PaymentPayload,
    pub payment_requirements: PaymentRequirements,
    /// Spending cap from the authorization, immutable for the session's
    /// lifetime.
    pub cap: U256,
    /// Permit deadline; past `deadline - buffer` no new charges are
    /// admitted.
    pub deadline: UnixTimestamp,
    /// Monotonically non-decreasing settled amount.
    pub settled_total: U256,
    /// Charges accrued but not yet settled on-chain.
    pub pending_spent: U256,
    pub status: SessionStatus,
    pub last_settlement: Option<SettlementRecord>,
    /// Last accrual time, feeding idle detection in the sweeper.
    pub touched_at_ms: u64,
}

impl Session {
    pub fn open(
        id: SessionId,
        payment_payload: PaymentPayload,
        payment_requirements: PaymentRequirements,
        cap: U256,
        deadline: UnixTimestamp,
    ) -> Self {
        Self {
            id,
            payment_payload,
            payment_requirements,
            cap,
            deadline,
            settled_total: U256::ZERO,
            pending_spent: U256::ZERO,
            status: SessionStatus::Open,
            last_settlement: None,
            touched_at_ms: UnixTimestamp::now_millis(),
        }
    }

    /// Spend still admissible under the cap.
    pub fn headroom(&self) -> U256 {
        self.cap
            .saturating_sub(self.settled_total)
            .saturating_sub(self.pending_spent)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_unique() {
        assert_ne!(SessionId::mint(), SessionId::mint());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&SessionStatus::Settling).unwrap(), "\"settling\"");
        assert_eq!(SessionStatus::Closed.to_string(), "closed");
    }

    #[test]
    fn headroom_accounts_for_settled_and_pending() {
        let mut session = testing::session("s", 1_000_000, 3600);
        session.settled_total = U256::from(300_000u64);
        session.pending_spent = U256::from(200_000u64);
        assert_eq!(session.headroom(), U256::from(500_000u64));
    }
}
