//! Facilitator dispatcher: routes verify/settle/capability requests to the
//! registered per-scheme-per-network handler and wraps every operation in a
//! lifecycle hook pipeline.
//!
//! The registry is written during startup and immutable afterwards.
//! Registration order is preserved so `/supported` output is deterministic;
//! re-registering a `(network, scheme)` pair replaces the handler in place
//! and the last write wins.
//!
//! Hooks are observability-only: they run in registration order between the
//! semantic steps of each operation, and a failing hook is logged and
//! swallowed without altering control flow.

use async_trait::async_trait;
use std::convert::Infallible;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::instrument;

use crate::chain::ChainId;
use crate::facilitator::Facilitator;
use crate::proto::{
    ErrorReason, PaymentPayload, PaymentRequirements, SettleResponse, SupportedPaymentKind,
    SupportedResponse, VerifyResponse,
};
use crate::scheme::SchemeHandler;

/// Which operation a hook observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Verify,
    Settle,
}

impl Display for HookPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::Verify => write!(f, "verify"),
            HookPhase::Settle => write!(f, "settle"),
        }
    }
}

/// The `(scheme, network)` pair a request was routed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRef {
    pub scheme: String,
    pub network: ChainId,
}

/// Outcome attached to post-operation hook invocations.
#[derive(Debug, Clone)]
pub enum HookResponse {
    Verify(VerifyResponse),
    Settle(SettleResponse),
}

/// Context record passed to every hook invocation.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub phase: HookPhase,
    pub handler: HandlerRef,
    pub payload: PaymentPayload,
    pub requirements: PaymentRequirements,
    pub response: Option<HookResponse>,
    pub error_reason: Option<String>,
}

impl HookContext {
    fn new(
        phase: HookPhase,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Self {
        Self {
            phase,
            handler: HandlerRef {
                scheme: requirements.scheme.clone(),
                network: requirements.network.clone(),
            },
            payload: payload.clone(),
            requirements: requirements.clone(),
            response: None,
            error_reason: None,
        }
    }

    fn with_verify_response(mut self, response: &VerifyResponse) -> Self {
        self.error_reason = response.invalid_reason().map(str::to_string);
        self.response = Some(HookResponse::Verify(response.clone()));
        self
    }

    fn with_settle_response(mut self, response: &SettleResponse) -> Self {
        self.error_reason = response.error_reason().map(str::to_string);
        self.response = Some(HookResponse::Settle(response.clone()));
        self
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

/// An asynchronous observer of verify/settle lifecycle events.
#[async_trait]
pub trait FacilitatorHook: Send + Sync {
    async fn call(&self, context: &HookContext) -> Result<(), HookError>;
}

#[derive(Default)]
struct HookRegistry {
    before_verify: Vec<Arc<dyn FacilitatorHook>>,
    after_verify: Vec<Arc<dyn FacilitatorHook>>,
    verify_failure: Vec<Arc<dyn FacilitatorHook>>,
    before_settle: Vec<Arc<dyn FacilitatorHook>>,
    after_settle: Vec<Arc<dyn FacilitatorHook>>,
    settle_failure: Vec<Arc<dyn FacilitatorHook>>,
}

struct HandlerEntry {
    network: ChainId,
    scheme: String,
    handler: Arc<dyn SchemeHandler>,
}

/// The registry-backed facilitator.
#[derive(Default)]
pub struct FacilitatorDispatcher {
    entries: Vec<HandlerEntry>,
    hooks: HookRegistry,
}

impl fmt::Debug for FacilitatorDispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let slugs: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("{}:{}", e.network, e.scheme))
            .collect();
        f.debug_tuple("FacilitatorDispatcher").field(&slugs).finish()
    }
}

impl FacilitatorDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `handler` under `(network, handler.scheme())`. Re-registering
    /// the same pair overwrites in place; the last write wins.
    pub fn register(&mut self, network: ChainId, handler: Arc<dyn SchemeHandler>) {
        let scheme = handler.scheme().to_string();
        tracing::info!(network = %network, scheme = %scheme, "Registered scheme handler");
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.network == network && e.scheme == scheme)
        {
            entry.handler = handler;
        } else {
            self.entries.push(HandlerEntry {
                network,
                scheme,
                handler,
            });
        }
    }

    pub fn and_register(mut self, network: ChainId, handler: Arc<dyn SchemeHandler>) -> Self {
        self.register(network, handler);
        self
    }

    pub fn on_before_verify(mut self, hook: Arc<dyn FacilitatorHook>) -> Self {
        self.hooks.before_verify.push(hook);
        self
    }

    pub fn on_after_verify(mut self, hook: Arc<dyn FacilitatorHook>) -> Self {
        self.hooks.after_verify.push(hook);
        self
    }

    pub fn on_verify_failure(mut self, hook: Arc<dyn FacilitatorHook>) -> Self {
        self.hooks.verify_failure.push(hook);
        self
    }

    pub fn on_before_settle(mut self, hook: Arc<dyn FacilitatorHook>) -> Self {
        self.hooks.before_settle.push(hook);
        self
    }

    pub fn on_after_settle(mut self, hook: Arc<dyn FacilitatorHook>) -> Self {
        self.hooks.after_settle.push(hook);
        self
    }

    pub fn on_settle_failure(mut self, hook: Arc<dyn FacilitatorHook>) -> Self {
        self.hooks.settle_failure.push(hook);
        self
    }

    fn lookup(&self, network: &ChainId, scheme: &str) -> Option<&HandlerEntry> {
        self.entries
            .iter()
            .find(|e| e.network == *network && e.scheme == scheme)
    }

    async fn fire(&self, slot: &'static str, hooks: &[Arc<dyn FacilitatorHook>], context: &HookContext) {
        for hook in hooks {
            if let Err(error) = hook.call(context).await {
                tracing::warn!(%error, slot, phase = %context.phase, "Hook failed");
            }
        }
    }

    /// Concrete entry point of the verify pipeline; the [`Facilitator`]
    /// impl delegates here.
    #[instrument(skip_all, fields(network = %requirements.network, scheme = %requirements.scheme))]
    pub async fn dispatch_verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> VerifyResponse {
        let context = HookContext::new(HookPhase::Verify, payload, requirements);
        let Some(entry) = self.lookup(&requirements.network, &requirements.scheme) else {
            let response =
                VerifyResponse::invalid(ErrorReason::UnsupportedSchemeNetwork, None);
            let context = context.with_verify_response(&response);
            self.fire("onVerifyFailure", &self.hooks.verify_failure, &context)
                .await;
            return response;
        };

        self.fire("onBeforeVerify", &self.hooks.before_verify, &context)
            .await;

        let response = match entry.handler.verify(payload, requirements).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%error, "Scheme handler verify failed unexpectedly");
                VerifyResponse::invalid(ErrorReason::VerificationError, None)
            }
        };

        let context = context.with_verify_response(&response);
        if response.is_valid() {
            self.fire("onAfterVerify", &self.hooks.after_verify, &context)
                .await;
        } else {
            self.fire("onVerifyFailure", &self.hooks.verify_failure, &context)
                .await;
        }
        response
    }

    /// Concrete entry point of the settle pipeline; the [`Facilitator`]
    /// impl delegates here.
    #[instrument(skip_all, fields(network = %requirements.network, scheme = %requirements.scheme))]
    pub async fn dispatch_settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> SettleResponse {
        let network = requirements.network.to_string();
        let context = HookContext::new(HookPhase::Settle, payload, requirements);
        let Some(entry) = self.lookup(&requirements.network, &requirements.scheme) else {
            let response = SettleResponse::error(
                ErrorReason::UnsupportedSchemeNetwork,
                network,
                None,
            );
            let context = context.with_settle_response(&response);
            self.fire("onSettleFailure", &self.hooks.settle_failure, &context)
                .await;
            return response;
        };

        self.fire("onBeforeSettle", &self.hooks.before_settle, &context)
            .await;

        let response = match entry.handler.settle(payload, requirements).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%error, "Scheme handler settle failed unexpectedly");
                SettleResponse::error(ErrorReason::SettlementFailed, network, None)
            }
        };

        let context = context.with_settle_response(&response);
        if response.is_success() {
            self.fire("onAfterSettle", &self.hooks.after_settle, &context)
                .await;
        } else {
            self.fire("onSettleFailure", &self.hooks.settle_failure, &context)
                .await;
        }
        response
    }

    /// Concrete entry point of the `/supported` aggregation; the
    /// [`Facilitator`] impl delegates here.
    pub fn aggregate_supported(&self) -> SupportedResponse {
        let kinds = self
            .entries
            .iter()
            .map(|entry| SupportedPaymentKind {
                network: entry.network.clone(),
                scheme: entry.scheme.clone(),
                extra: entry.handler.extra(&entry.network),
            })
            .collect();

        let mut signers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in &self.entries {
            let family = entry.handler.caip_family().to_string();
            let addresses = signers.entry(family).or_default();
            for address in entry.handler.signers(&entry.network) {
                if !addresses.contains(&address) {
                    addresses.push(address);
                }
            }
        }

        SupportedResponse { kinds, signers }
    }
}

impl Facilitator for FacilitatorDispatcher {
    type Error = Infallible;

    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, Self::Error> {
        Ok(self.dispatch_verify(payload, requirements).await)
    }

    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, Self::Error> {
        Ok(self.dispatch_settle(payload, requirements).await)
    }

    async fn supported(&self) -> Result<SupportedResponse, Self::Error> {
        Ok(self.aggregate_supported())
    }
}
