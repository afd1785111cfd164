//! Payment facilitator for the [x402 protocol](https://www.x402.org) with
//! capped, session-based "upto" payments.
//!
//! The facilitator sits between a merchant resource server and blockchain
//! settlement: it verifies signed off-chain payment authorizations and
//! turns them into settled on-chain transfers.
//!
//! # Architecture
//!
//! - [`dispatcher`] — the [`FacilitatorDispatcher`](dispatcher::FacilitatorDispatcher)
//!   routes verify/settle/capability requests to the registered
//!   per-scheme-per-network handler and runs a lifecycle hook pipeline
//!   around every operation.
//! - [`scheme`] — the [`SchemeHandler`](scheme::SchemeHandler) contract and
//!   the EIP-2612 permit based [`upto_eip155`](scheme::upto_eip155)
//!   handler: verify a capped permit, settle batches via permit /
//!   allowance-fallback / `transferFrom`.
//! - [`session`] — the upto session engine: a concurrent
//!   [`SessionStore`](session::SessionStore) tracking per-session accrued
//!   spend under cap and deadline invariants, the settlement orchestrator
//!   coalescing charges into batched settlements, and the background
//!   sweeper.
//! - [`facilitator`] — the [`Facilitator`](facilitator::Facilitator) trait
//!   the session engine consumes, implemented by the in-process dispatcher
//!   and the [`client`] HTTP client alike.
//! - [`chain`] — CAIP-2 identifiers and the EIP-155 signer port with its
//!   Alloy-backed implementation.
//! - [`proto`] — wire types, the stable error-tag taxonomy, and the
//!   `PAYMENT-*` header codec.
//!
//! # Roles
//!
//! Run the [`run`] server for a standalone facilitator, or embed the
//! session engine next to a merchant server with
//! [`UptoSessionManager`](session::UptoSessionManager) pointed at a local
//! dispatcher or a remote facilitator.

pub mod chain;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod facilitator;
pub mod handlers;
pub mod proto;
pub mod run;
pub mod scheme;
pub mod session;
pub mod sig_down;
pub mod telemetry;
pub mod timestamp;
