//! Front door of the upto session engine.
//!
//! The manager admits metered charges: the first charge of a session
//! verifies the signed payment with the facilitator and creates the session
//! from the authorization's cap and deadline; subsequent charges accrue
//! against the stored session without re-verifying. Explicit closes settle
//! whatever is pending and seal the session.

use alloy_primitives::U256;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::orchestrator::settle_upto_session;
use super::store::{AccrueError, SessionStore};
use super::sweeper::{SweeperConfig, UptoSweeper};
use super::{Session, SessionId};
use crate::facilitator::Facilitator;
use crate::proto::{PaymentPayload, PaymentRequirements};
use crate::scheme::upto_eip155::types::session_terms;

/// Tunables of the session engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UptoConfig {
    pub sweep_interval_secs: u64,
    pub idle_after_secs: u64,
    pub deadline_buffer_secs: u64,
    pub session_ttl_secs: u64,
}

impl Default for UptoConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            idle_after_secs: 10,
            deadline_buffer_secs: 60,
            session_ttl_secs: 3_600,
        }
    }
}

impl From<&UptoConfig> for SweeperConfig {
    fn from(config: &UptoConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.sweep_interval_secs),
            idle_after_ms: config.idle_after_secs * 1_000,
            deadline_buffer_secs: config.deadline_buffer_secs,
            session_ttl_ms: config.session_ttl_secs * 1_000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChargeError {
    #[error("payment verification refused: {reason}")]
    Refused {
        reason: String,
        payer: Option<String>,
    },
    #[error("facilitator unavailable: {0}")]
    Facilitator(String),
    #[error("payment payload carries no usable upto authorization")]
    InvalidAuthorization,
    #[error(transparent)]
    Accrual(#[from] AccrueError),
}

pub struct UptoSessionManager<F> {
    store: Arc<SessionStore>,
    facilitator: Arc<F>,
    config: UptoConfig,
}

impl<F> UptoSessionManager<F>
where
    F: Facilitator + Send + Sync + 'static,
{
    pub fn new(facilitator: Arc<F>, config: UptoConfig) -> Self {
        Self {
            store: Arc::new(SessionStore::new()),
            facilitator,
            config,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Admits a metered charge.
    ///
    /// With a known `session_id` the charge accrues against the stored
    /// session. Otherwise the payment is verified with the facilitator, a
    /// session is created from the authorization's cap and deadline (under
    /// the merchant-chosen id, or a minted one), and the charge accrues
    /// there. Returns the post-charge session snapshot.
    #[instrument(skip_all, fields(amount = %amount))]
    pub async fn charge(
        &self,
        session_id: Option<SessionId>,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
        amount: U256,
    ) -> Result<Session, ChargeError> {
        if let Some(id) = &session_id {
            if self.store.get(id).await.is_some() {
                return Ok(self
                    .store
                    .accrue(id, amount, self.config.deadline_buffer_secs)
                    .await?);
            }
        }

        let verdict = self
            .facilitator
            .verify(payload, requirements)
            .await
            .map_err(|error| ChargeError::Facilitator(error.to_string()))?;
        if !verdict.is_valid() {
            return Err(ChargeError::Refused {
                reason: verdict
                    .invalid_reason()
                    .unwrap_or("verification_error")
                    .to_string(),
                payer: verdict.payer().map(str::to_string),
            });
        }

        let terms = session_terms(payload).ok_or(ChargeError::InvalidAuthorization)?;
        let id = session_id.unwrap_or_else(SessionId::mint);
        let session = Session::open(
            id.clone(),
            payload.clone(),
            requirements.clone(),
            terms.cap,
            terms.deadline,
        );
        if self.store.insert(session) {
            tracing::info!(session = %id, cap = %terms.cap, payer = %terms.payer, "Opened upto session");
        }

        Ok(self
            .store
            .accrue(&id, amount, self.config.deadline_buffer_secs)
            .await?)
    }

    /// Settles whatever is pending and closes the session. Returns the
    /// closed session snapshot, or `None` for an unknown id.
    #[instrument(skip_all, fields(session = %id))]
    pub async fn close(&self, id: &SessionId) -> Option<Session> {
        settle_upto_session(
            self.store.as_ref(),
            self.facilitator.as_ref(),
            id,
            "close",
            true,
            self.config.deadline_buffer_secs,
        )
        .await;
        self.store.get(id).await
    }

    /// Spawns the background sweeper for this manager's store.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        UptoSweeper::new(
            self.store.clone(),
            self.facilitator.clone(),
            SweeperConfig::from(&self.config),
        )
        .spawn(cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{ErrorReason, VerifyResponse};
    use crate::session::testing::{self, MockFacilitator};
    use crate::session::SessionStatus;
    use crate::timestamp::UnixTimestamp;

    fn manager(facilitator: Arc<MockFacilitator>) -> UptoSessionManager<MockFacilitator> {
        UptoSessionManager::new(facilitator, UptoConfig::default())
    }

    fn charge_inputs(cap: u64) -> (PaymentPayload, PaymentRequirements) {
        let deadline = UnixTimestamp::now().as_secs() + 3600;
        (testing::payload(cap, deadline), testing::requirements())
    }

    #[tokio::test]
    async fn first_charge_verifies_and_opens_session() {
        let facilitator = Arc::new(MockFacilitator::new());
        let manager = manager(facilitator.clone());
        let (payload, requirements) = charge_inputs(1_000_000);

        let session = manager
            .charge(None, &payload, &requirements, U256::from(100_000u64))
            .await
            .unwrap();

        assert_eq!(facilitator.verify_calls(), 1);
        assert_eq!(session.cap, U256::from(1_000_000u64));
        assert_eq!(session.pending_spent, U256::from(100_000u64));
        assert_eq!(session.status, SessionStatus::Open);
    }

    #[tokio::test]
    async fn subsequent_charges_reuse_session_without_reverifying() {
        let facilitator = Arc::new(MockFacilitator::new());
        let manager = manager(facilitator.clone());
        let (payload, requirements) = charge_inputs(1_000_000);

        let session = manager
            .charge(None, &payload, &requirements, U256::from(100_000u64))
            .await
            .unwrap();
        let reused = manager
            .charge(
                Some(session.id.clone()),
                &payload,
                &requirements,
                U256::from(50_000u64),
            )
            .await
            .unwrap();

        assert_eq!(facilitator.verify_calls(), 1);
        assert_eq!(reused.pending_spent, U256::from(150_000u64));
    }

    #[tokio::test]
    async fn merchant_chosen_session_id_is_kept() {
        let facilitator = Arc::new(MockFacilitator::new());
        let manager = manager(facilitator);
        let (payload, requirements) = charge_inputs(1_000_000);

        let session = manager
            .charge(
                Some(SessionId::from("order-42")),
                &payload,
                &requirements,
                U256::from(1u64),
            )
            .await
            .unwrap();
        assert_eq!(session.id, SessionId::from("order-42"));
    }

    #[tokio::test]
    async fn refused_verification_opens_no_session() {
        let facilitator = Arc::new(MockFacilitator::new());
        facilitator.queue_verify(VerifyResponse::invalid(
            ErrorReason::InvalidPermitSignature,
            Some("0xAAAA".into()),
        ));
        let manager = manager(facilitator);
        let (payload, requirements) = charge_inputs(1_000_000);

        let error = manager
            .charge(None, &payload, &requirements, U256::from(1u64))
            .await
            .unwrap_err();
        match error {
            ChargeError::Refused { reason, payer } => {
                assert_eq!(reason, "invalid_permit_signature");
                assert_eq!(payer.as_deref(), Some("0xAAAA"));
            }
            other => panic!("expected Refused, got {other:?}"),
        }
        assert!(manager.store().is_empty());
    }

    #[tokio::test]
    async fn charge_beyond_cap_is_rejected() {
        let facilitator = Arc::new(MockFacilitator::new());
        let manager = manager(facilitator);
        let (payload, requirements) = charge_inputs(100);

        let session = manager
            .charge(None, &payload, &requirements, U256::from(90u64))
            .await
            .unwrap();
        let error = manager
            .charge(
                Some(session.id.clone()),
                &payload,
                &requirements,
                U256::from(20u64),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, ChargeError::Accrual(AccrueError::CapExceeded)));
    }

    #[tokio::test]
    async fn close_settles_pending_and_seals_the_session() {
        let facilitator = Arc::new(MockFacilitator::new());
        let manager = manager(facilitator.clone());
        let (payload, requirements) = charge_inputs(1_000_000);

        let session = manager
            .charge(None, &payload, &requirements, U256::from(100_000u64))
            .await
            .unwrap();
        let closed = manager.close(&session.id).await.unwrap();

        assert_eq!(closed.status, SessionStatus::Closed);
        assert_eq!(closed.settled_total, U256::from(100_000u64));
        assert_eq!(closed.pending_spent, U256::ZERO);
        assert_eq!(facilitator.settled_amounts(), vec!["100000".to_string()]);

        // A closed session admits nothing further.
        let error = manager
            .charge(
                Some(session.id.clone()),
                &payload,
                &requirements,
                U256::from(1u64),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            ChargeError::Accrual(AccrueError::NotOpen(SessionStatus::Closed))
        ));
    }

    #[tokio::test]
    async fn close_of_unknown_session_returns_none() {
        let facilitator = Arc::new(MockFacilitator::new());
        let manager = manager(facilitator);
        assert!(manager.close(&SessionId::from("ghost")).await.is_none());
    }

    #[tokio::test]
    async fn unusable_authorization_is_rejected() {
        let facilitator = Arc::new(MockFacilitator::new());
        let manager = manager(facilitator);
        let (mut payload, requirements) = charge_inputs(1_000_000);
        payload.payload = serde_json::json!({"signature": "0x11"});

        let error = manager
            .charge(None, &payload, &requirements, U256::from(1u64))
            .await
            .unwrap_err();
        assert!(matches!(error, ChargeError::InvalidAuthorization));
    }
}
