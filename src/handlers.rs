//! HTTP endpoints of the facilitator server.
//!
//! Protocol-critical endpoints (`/verify`, `/settle`), the discovery
//! endpoint (`/supported`), and the upto session close endpoint
//! (`/api/upto-close`). All payloads are the JSON wire types of
//! [`crate::proto`]; close responses additionally carry the final receipt
//! base64-encoded in the `PAYMENT-RESPONSE` header.

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

use crate::dispatcher::FacilitatorDispatcher;
use crate::proto::headers::{PAYMENT_RESPONSE_HEADER, UPTO_SESSION_ID_HEADER, encode_header};
use crate::proto::{ErrorResponse, SettleRequest, SettleResponse, VerifyRequest};
use crate::session::{SessionId, SessionStatus, UptoSessionManager};

/// Shared server state: the dispatcher plus the session engine running
/// against it.
#[derive(Clone)]
pub struct AppState {
    pub facilitator: Arc<FacilitatorDispatcher>,
    pub sessions: Arc<UptoSessionManager<FacilitatorDispatcher>>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(|| async { "x402 facilitator" }))
        .route("/verify", get(get_verify_info).post(post_verify))
        .route("/settle", get(get_settle_info).post(post_settle))
        .route("/supported", get(get_supported))
        .route("/api/upto-close", post(post_upto_close))
}

/// `GET /verify`: machine-readable description of the verify endpoint.
#[instrument(skip_all)]
async fn get_verify_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/verify",
        "description": "POST to verify x402 payments",
        "body": {
            "paymentPayload": "PaymentPayload",
            "paymentRequirements": "PaymentRequirements",
        }
    }))
}

/// `GET /settle`: machine-readable description of the settle endpoint.
#[instrument(skip_all)]
async fn get_settle_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/settle",
        "description": "POST to settle x402 payments",
        "body": {
            "paymentPayload": "PaymentPayload",
            "paymentRequirements": "PaymentRequirements",
        }
    }))
}

/// `POST /verify`: facilitator-side verification of a proposed payment.
#[instrument(skip_all)]
async fn post_verify(
    State(state): State<AppState>,
    Json(body): Json<VerifyRequest>,
) -> impl IntoResponse {
    let response = state
        .facilitator
        .dispatch_verify(&body.payment_payload, &body.payment_requirements)
        .await;
    (StatusCode::OK, Json(response))
}

/// `POST /settle`: facilitator-side execution of an accepted payment.
#[instrument(skip_all)]
async fn post_settle(
    State(state): State<AppState>,
    Json(body): Json<SettleRequest>,
) -> impl IntoResponse {
    let response = state
        .facilitator
        .dispatch_settle(&body.payment_payload, &body.payment_requirements)
        .await;
    (StatusCode::OK, Json(response))
}

/// `GET /supported`: payment kinds and signers of this facilitator.
#[instrument(skip_all)]
async fn get_supported(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.facilitator.aggregate_supported()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UptoCloseRequest {
    session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UptoCloseResponse {
    session_id: String,
    status: SessionStatus,
    settled_total: String,
    pending_spent: String,
    receipt: SettleResponse,
}

/// `POST /api/upto-close`: settles a session's pending spend and closes it.
///
/// The final receipt is returned in the body and in the `PAYMENT-RESPONSE`
/// header; the session id is echoed in `x-upto-session-id`.
#[instrument(skip_all, fields(session = %body.session_id))]
async fn post_upto_close(
    State(state): State<AppState>,
    Json(body): Json<UptoCloseRequest>,
) -> impl IntoResponse {
    let id = SessionId::new(body.session_id);
    let Some(session) = state.sessions.close(&id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("unknown session {id}"),
            }),
        )
            .into_response();
    };

    let receipt = session
        .last_settlement
        .as_ref()
        .map(|record| record.receipt.clone())
        .unwrap_or_else(|| {
            // Closed with nothing pending and never settled: no on-chain
            // action, empty transaction.
            SettleResponse::success("", session.payment_requirements.network.to_string(), None)
        });

    let mut headers = HeaderMap::new();
    if let Ok(encoded) = encode_header(&receipt) {
        if let Ok(value) = HeaderValue::from_str(&encoded) {
            headers.insert(PAYMENT_RESPONSE_HEADER, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(id.as_str()) {
        headers.insert(UPTO_SESSION_ID_HEADER, value);
    }

    let response = UptoCloseResponse {
        session_id: id.to_string(),
        status: session.status,
        settled_total: session.settled_total.to_string(),
        pending_spent: session.pending_spent.to_string(),
        receipt,
    };
    (StatusCode::OK, headers, Json(response)).into_response()
}
