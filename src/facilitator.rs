//! Core trait defining the verification and settlement interface of a
//! facilitator.
//!
//! Implementors validate incoming payment payloads against requirements
//! ([`Facilitator::verify`]) and execute on-chain transfers
//! ([`Facilitator::settle`]). Both the in-process
//! [`FacilitatorDispatcher`](crate::dispatcher::FacilitatorDispatcher) and
//! the remote [`FacilitatorHttpClient`](crate::client::FacilitatorHttpClient)
//! implement it, so the upto session engine can run embedded next to the
//! dispatcher or against a facilitator across the network.

use std::fmt::{Debug, Display};
use std::sync::Arc;

use crate::proto::{PaymentPayload, PaymentRequirements, SettleResponse, SupportedResponse,
    VerifyResponse};

pub trait Facilitator {
    /// The error type returned by this facilitator.
    type Error: Debug + Display + Send;

    /// Verifies a proposed payment payload against the given requirements.
    ///
    /// Protocol-level rejections come back as an invalid [`VerifyResponse`]
    /// with a tagged reason; [`Self::Error`] is reserved for transport-level
    /// failures such as an unreachable remote facilitator.
    fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> impl Future<Output = Result<VerifyResponse, Self::Error>> + Send;

    /// Executes an on-chain settlement for an accepted payment payload.
    ///
    /// Callers pass the requirements they want settled, which for the upto
    /// scheme carry the batched amount rather than the per-charge price.
    fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> impl Future<Output = Result<SettleResponse, Self::Error>> + Send;

    /// Lists the payment kinds this facilitator can verify and settle.
    fn supported(&self) -> impl Future<Output = Result<SupportedResponse, Self::Error>> + Send;
}

impl<T: Facilitator + Sync> Facilitator for Arc<T> {
    type Error = T::Error;

    fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> impl Future<Output = Result<VerifyResponse, Self::Error>> + Send {
        self.as_ref().verify(payload, requirements)
    }

    fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> impl Future<Output = Result<SettleResponse, Self::Error>> + Send {
        self.as_ref().settle(payload, requirements)
    }

    fn supported(&self) -> impl Future<Output = Result<SupportedResponse, Self::Error>> + Send {
        self.as_ref().supported()
    }
}
