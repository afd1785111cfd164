//! Facilitator server bootstrap.
//!
//! Wires configuration into chain providers, registers the upto scheme
//! handler per configured chain, starts the session sweeper, and serves the
//! HTTP endpoints until SIGTERM/SIGINT. In-flight settlements finish before
//! the process exits; on-chain transactions are never cancelled client-side.

use async_trait::async_trait;
use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use crate::chain::eip155::Eip155ChainProvider;
use crate::config::Config;
use crate::dispatcher::{FacilitatorDispatcher, FacilitatorHook, HookContext, HookError};
use crate::handlers::{self, AppState};
use crate::scheme::upto_eip155::UptoEip155Handler;
use crate::session::UptoSessionManager;
use crate::sig_down::SigDown;
use crate::telemetry::Telemetry;

/// Observability hook logging every refused verification and failed
/// settlement.
struct FailureLogHook;

#[async_trait]
impl FacilitatorHook for FailureLogHook {
    async fn call(&self, context: &HookContext) -> Result<(), HookError> {
        tracing::warn!(
            phase = %context.phase,
            network = %context.handler.network,
            scheme = %context.handler.scheme,
            reason = context.error_reason.as_deref().unwrap_or("unknown"),
            "Payment operation failed"
        );
        Ok(())
    }
}

/// Initializes and runs the facilitator server.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let _telemetry = Telemetry::init();

    let config = Config::load()?;

    let mut dispatcher = FacilitatorDispatcher::new();
    for chain_config in config.chains() {
        let provider = Arc::new(Eip155ChainProvider::from_config(chain_config)?);
        let chain = *provider.chain();
        let handler = Arc::new(UptoEip155Handler::new(chain, provider));
        dispatcher.register(chain.as_chain_id(), handler);
    }
    let dispatcher = dispatcher
        .on_verify_failure(Arc::new(FailureLogHook))
        .on_settle_failure(Arc::new(FailureLogHook));

    let facilitator = Arc::new(dispatcher);
    let sessions = Arc::new(UptoSessionManager::new(
        facilitator.clone(),
        config.upto().clone(),
    ));

    let sig_down = SigDown::try_new()?;
    let sweeper = sessions.spawn_sweeper(sig_down.cancellation_token());

    let state = AppState {
        facilitator,
        sessions,
    };
    let app = Router::new()
        .merge(handlers::routes().with_state(state))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!("Starting facilitator at http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .inspect_err(|e| tracing::error!("Failed to bind to {}: {}", addr, e))?;

    let shutdown_token = sig_down.cancellation_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await?;

    // Let the sweeper finish any settlement it has in flight.
    sweeper.await?;
    Ok(())
}
