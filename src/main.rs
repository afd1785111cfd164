//! x402 facilitator HTTP server binary.
//!
//! Launches an Axum-based server exposing the x402 facilitator interface
//! plus the upto session engine:
//!
//! - `GET /verify` / `POST /verify` – verification schema and verification
//! - `GET /settle` / `POST /settle` – settlement schema and settlement
//! - `GET /supported` – supported payment kinds and signers
//! - `POST /api/upto-close` – settle and close an upto session
//!
//! Configuration comes from a JSON file (`--config`, default
//! `config.json`), with `.env` values loaded at startup and `OTEL_*`
//! variables enabling span export.

use std::process;

use x402_facilitator::run::run;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{e}");
        process::exit(1)
    }
}
