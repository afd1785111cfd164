//! Base64 header codec for the payment envelope.
//!
//! The merchant returns `402` with a `PAYMENT-REQUIRED` header carrying the
//! base64-encoded [`PaymentRequired`](super::PaymentRequired) body; the
//! client retries with `PAYMENT-SIGNATURE` carrying the encoded
//! [`PaymentPayload`](super::PaymentPayload); settlement receipts travel
//! back in `PAYMENT-RESPONSE`. Upto session ids surface in
//! `x-upto-session-id`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub const PAYMENT_REQUIRED_HEADER: &str = "PAYMENT-REQUIRED";
pub const PAYMENT_SIGNATURE_HEADER: &str = "PAYMENT-SIGNATURE";
pub const PAYMENT_RESPONSE_HEADER: &str = "PAYMENT-RESPONSE";
pub const UPTO_SESSION_ID_HEADER: &str = "x-upto-session-id";

#[derive(Debug, thiserror::Error)]
pub enum HeaderCodecError {
    #[error("header is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("header payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a wire value into base64-encoded JSON, suitable for a header value.
pub fn encode_header<T: Serialize>(value: &T) -> Result<String, HeaderCodecError> {
    let json = serde_json::to_vec(value)?;
    Ok(b64.encode(json))
}

/// Decode a base64 header value back into a wire type.
pub fn decode_header<T: DeserializeOwned>(value: &str) -> Result<T, HeaderCodecError> {
    let bytes = b64.decode(value)?;
    Ok(serde_json::from_slice(&bytes)?)
}
