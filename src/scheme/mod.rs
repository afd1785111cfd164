//! Payment scheme handlers.
//!
//! A [`SchemeHandler`] is the per-scheme-per-network unit of work the
//! dispatcher routes to. Handlers declare their scheme name and caip family,
//! advertise scheme metadata for `/supported`, and implement the verify and
//! settle algorithms of their protocol.

pub mod upto_eip155;

use async_trait::async_trait;

use crate::chain::{ChainId, ChainIdPattern};
use crate::chain::eip155::SignerError;
use crate::proto::{PaymentPayload, PaymentRequirements, SettleResponse, VerifyResponse};

/// Error escaping a scheme handler.
///
/// Handlers convert every protocol-level rejection into a tagged response
/// themselves; an `Err` means something outside the protocol went wrong
/// (RPC transport down, signer unavailable) and the dispatcher will map it
/// to `verification_error` / `settlement_failed`.
#[derive(Debug, thiserror::Error)]
pub enum SchemeHandlerError {
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("{0}")]
    Other(String),
}

/// Per-scheme-per-network payment handler.
#[async_trait]
pub trait SchemeHandler: Send + Sync {
    /// Literal scheme name, e.g. `"exact"` or `"upto"`.
    fn scheme(&self) -> &str;

    /// The `family:*` pattern grouping this handler's signers in
    /// `/supported`.
    fn caip_family(&self) -> ChainIdPattern;

    /// Scheme metadata advertised to clients for the given network
    /// (EIP-712 domain names, paymaster endpoints, sponsor addresses).
    fn extra(&self, network: &ChainId) -> Option<serde_json::Value>;

    /// Facilitator-side addresses paying gas or signing on the given
    /// network.
    fn signers(&self, network: &ChainId) -> Vec<String>;

    /// Verifies a payment payload against the requirements.
    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, SchemeHandlerError>;

    /// Settles an accepted payment on-chain.
    ///
    /// Handlers re-check what they need to; the dispatcher does not verify
    /// before settling.
    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, SchemeHandlerError>;
}
