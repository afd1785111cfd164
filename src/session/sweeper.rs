//! Background sweeper driving batched settlements.
//!
//! Periodically walks the session store and invokes the orchestrator:
//! sessions inside the deadline buffer are settled and closed, idle sessions
//! with pending spend are flushed, and stale closed sessions are evicted.
//! Explicit closes racing a sweep are harmless since the `settling` status
//! gate admits only one settlement attempt per session.

use alloy_primitives::U256;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::orchestrator::settle_upto_session;
use super::store::SessionStore;
use super::SessionStatus;
use crate::facilitator::Facilitator;
use crate::timestamp::UnixTimestamp;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Cadence of sweep passes.
    pub interval: Duration,
    /// Pending spend older than this settles with reason `idle` instead of
    /// `periodic`.
    pub idle_after_ms: u64,
    /// Sessions whose deadline is inside this window are settled and
    /// closed.
    pub deadline_buffer_secs: u64,
    /// Closed sessions are evicted after this long without activity.
    pub session_ttl_ms: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            idle_after_ms: 10_000,
            deadline_buffer_secs: 60,
            session_ttl_ms: 3_600_000,
        }
    }
}

pub struct UptoSweeper<F> {
    store: Arc<SessionStore>,
    facilitator: Arc<F>,
    config: SweeperConfig,
}

impl<F> UptoSweeper<F>
where
    F: Facilitator + Send + Sync + 'static,
{
    pub fn new(store: Arc<SessionStore>, facilitator: Arc<F>, config: SweeperConfig) -> Self {
        Self {
            store,
            facilitator,
            config,
        }
    }

    /// Spawns the sweep loop; it runs until the token is cancelled. An
    /// in-flight sweep pass finishes before the task exits, so settlements
    /// are never abandoned mid-receipt on shutdown.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.store.recover_settling().await;
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                self.sweep().await;
            }
            tracing::info!("Session sweeper stopped");
        })
    }

    /// One sweep pass over every session.
    pub async fn sweep(&self) {
        let now = UnixTimestamp::now();
        let now_ms = UnixTimestamp::now_millis();

        for id in self.store.session_ids() {
            let Some(session) = self.store.get(&id).await else {
                continue;
            };
            if session.status != SessionStatus::Open {
                continue;
            }

            if session.deadline <= now + self.config.deadline_buffer_secs {
                settle_upto_session(
                    &self.store,
                    self.facilitator.as_ref(),
                    &id,
                    "deadline_approaching",
                    true,
                    self.config.deadline_buffer_secs,
                )
                .await;
                continue;
            }

            if session.pending_spent > U256::ZERO {
                let idle = now_ms.saturating_sub(session.touched_at_ms) >= self.config.idle_after_ms;
                let reason = if idle { "idle" } else { "periodic" };
                settle_upto_session(
                    &self.store,
                    self.facilitator.as_ref(),
                    &id,
                    reason,
                    false,
                    self.config.deadline_buffer_secs,
                )
                .await;
            }
        }

        let evicted = self.store.evict_expired(self.config.session_ttl_ms).await;
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted expired closed sessions");
        }
    }
}
