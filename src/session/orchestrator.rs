//! Settlement orchestration for upto sessions.
//!
//! [`settle_upto_session`] moves a session through
//! `open → settling → open | closed`, issuing one batched settlement for the
//! accrued pending spend. The status CAS is the per-session settlement lock:
//! of two concurrent attempts exactly one transitions, the other observes a
//! non-open session and returns.
//!
//! Settlement failures are non-fatal. The pending spend stays intact for the
//! next sweep to retry, the failure is recorded on the session, and the
//! function never reports an error to its caller.

use alloy_primitives::U256;
use tracing::instrument;

use super::store::SessionStore;
use super::{SessionId, SessionStatus, SettlementRecord};
use crate::facilitator::Facilitator;
use crate::proto::{ErrorReason, SettleResponse};
use crate::timestamp::UnixTimestamp;

/// Settles the accrued pending spend of a session.
///
/// Absent or non-open sessions are skipped silently, which makes concurrent
/// sweeps and explicit closes idempotent. With `close_after` the session is
/// closed once the attempt completes regardless of outcome; otherwise it
/// closes only when the cap is exhausted or the deadline is inside the
/// buffer.
///
/// Returns the recorded settlement when an attempt was made.
#[instrument(skip_all, fields(session = %session_id, reason = reason))]
pub async fn settle_upto_session<F: Facilitator>(
    store: &SessionStore,
    facilitator: &F,
    session_id: &SessionId,
    reason: &str,
    close_after: bool,
    deadline_buffer_secs: u64,
) -> Option<SettlementRecord> {
    let session = store.get(session_id).await?;
    if session.status != SessionStatus::Open {
        return None;
    }

    if session.pending_spent == U256::ZERO {
        if close_after {
            let _ = store
                .transition(session_id, SessionStatus::Open, SessionStatus::Closed)
                .await;
            tracing::info!("Closed session with nothing pending");
        }
        return None;
    }

    // The settlement lock: exactly one caller wins this transition.
    let locked = store
        .transition(session_id, SessionStatus::Open, SessionStatus::Settling)
        .await
        .ok()?;

    let settle_amount = locked.pending_spent;
    let mut requirements = locked.payment_requirements.clone();
    requirements.amount = settle_amount.to_string();

    let receipt = match facilitator
        .settle(&locked.payment_payload, &requirements)
        .await
    {
        Ok(receipt) => receipt,
        Err(error) => {
            let message = error.to_string();
            let reason = if message.is_empty() {
                ErrorReason::SettlementFailed.to_string()
            } else {
                message
            };
            SettleResponse::error(reason, requirements.network.to_string(), None)
        }
    };

    let record = SettlementRecord {
        at_ms: UnixTimestamp::now_millis(),
        reason: reason.to_string(),
        receipt,
    };

    if record.receipt.is_success() {
        tracing::info!(amount = %settle_amount, transaction = record.receipt.transaction(), "Settled session batch");
    } else {
        tracing::warn!(
            amount = %settle_amount,
            error = record.receipt.error_reason().unwrap_or_default(),
            "Settlement attempt failed, pending spend kept for retry"
        );
    }

    let record_for_session = record.clone();
    store
        .update(session_id, move |session| {
            if record_for_session.receipt.is_success() {
                session.settled_total = session.settled_total.saturating_add(settle_amount);
                session.pending_spent = U256::ZERO;
            }
            session.last_settlement = Some(record_for_session);

            let deadline_reached =
                session.deadline <= UnixTimestamp::now() + deadline_buffer_secs;
            let cap_exhausted = session.settled_total >= session.cap;
            session.status = if close_after || cap_exhausted || deadline_reached {
                SessionStatus::Closed
            } else {
                SessionStatus::Open
            };
        })
        .await;

    Some(record)
}
