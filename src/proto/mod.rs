//! Wire types of the facilitator protocol surface.
//!
//! Requests and responses exchanged over `/verify`, `/settle` and
//! `/supported`, plus the payment envelope types carried in the `PAYMENT-*`
//! headers. All payloads are camelCase JSON, compatible with the x402 client
//! SDKs. Amount fields cross the wire as decimal strings of base units.

pub mod headers;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Display, Formatter};

use crate::chain::ChainId;

/// Version marker for x402 protocol version 2; serializes as the integer `2`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct X402Version2;

impl X402Version2 {
    pub const VALUE: u8 = 2;
}

impl From<X402Version2> for u8 {
    fn from(_: X402Version2) -> Self {
        X402Version2::VALUE
    }
}

impl Serialize for X402Version2 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for X402Version2 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let num = u8::deserialize(deserializer)?;
        if num == Self::VALUE {
            Ok(X402Version2)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected version {}, got {}",
                Self::VALUE,
                num
            )))
        }
    }
}

impl Display for X402Version2 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::VALUE)
    }
}

/// Stable error tags of the verify/settle wire contract.
///
/// The snake_case serialization of each variant is the tag string clients
/// match on; renaming a variant is a protocol break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    UnsupportedScheme,
    UnsupportedSchemeNetwork,
    InvalidUptoEvmPayload,
    NetworkMismatch,
    MissingEip712Domain,
    RecipientMismatch,
    CapTooLow,
    CapBelowRequiredMax,
    AuthorizationExpired,
    InvalidChainId,
    InvalidPermitSignature,
    VerificationError,
    TotalExceedsCap,
    UnsupportedSignatureType,
    InsufficientAllowance,
    PermitFailed,
    InvalidTransactionState,
    TransactionFailed,
    SettlementFailed,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::UnsupportedScheme => "unsupported_scheme",
            ErrorReason::UnsupportedSchemeNetwork => "unsupported_scheme_network",
            ErrorReason::InvalidUptoEvmPayload => "invalid_upto_evm_payload",
            ErrorReason::NetworkMismatch => "network_mismatch",
            ErrorReason::MissingEip712Domain => "missing_eip712_domain",
            ErrorReason::RecipientMismatch => "recipient_mismatch",
            ErrorReason::CapTooLow => "cap_too_low",
            ErrorReason::CapBelowRequiredMax => "cap_below_required_max",
            ErrorReason::AuthorizationExpired => "authorization_expired",
            ErrorReason::InvalidChainId => "invalid_chain_id",
            ErrorReason::InvalidPermitSignature => "invalid_permit_signature",
            ErrorReason::VerificationError => "verification_error",
            ErrorReason::TotalExceedsCap => "total_exceeds_cap",
            ErrorReason::UnsupportedSignatureType => "unsupported_signature_type",
            ErrorReason::InsufficientAllowance => "insufficient_allowance",
            ErrorReason::PermitFailed => "permit_failed",
            ErrorReason::InvalidTransactionState => "invalid_transaction_state",
            ErrorReason::TransactionFailed => "transaction_failed",
            ErrorReason::SettlementFailed => "settlement_failed",
        }
    }
}

impl Display for ErrorReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ErrorReason> for String {
    fn from(reason: ErrorReason) -> Self {
        reason.as_str().to_string()
    }
}

/// Metadata about the resource being paid for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub description: String,
    pub mime_type: String,
    pub url: String,
}

/// Payment terms set by the seller: scheme, network, asset, recipient and
/// amount (a decimal string of base units). `extra` carries scheme-specific
/// hints such as the EIP-712 domain `name`/`version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: ChainId,
    pub asset: String,
    pub pay_to: String,
    pub amount: String,
    pub max_timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// A signed payment authorization from the buyer.
///
/// `accepted` pins the exact requirements the client signed against;
/// `payload` is the scheme-specific signed material, kept generic here and
/// given a typed view at handler entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: X402Version2,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
    pub accepted: PaymentRequirements,
    pub payload: serde_json::Value,
}

/// HTTP 402 response body, carried base64-encoded in the `PAYMENT-REQUIRED`
/// header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    pub x402_version: X402Version2,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceInfo>,
    #[serde(default)]
    pub accepts: Vec<PaymentRequirements>,
}

/// Body of `POST /verify` and `POST /settle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub x402_version: X402Version2,
    pub payment_payload: PaymentPayload,
    pub payment_requirements: PaymentRequirements,
}

pub type SettleRequest = VerifyRequest;

/// Result of verifying a [`PaymentPayload`] against [`PaymentRequirements`].
///
/// `payer` is reported best-effort even on failure, so sellers can attribute
/// rejected attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyResponse {
    Valid {
        payer: String,
    },
    Invalid {
        reason: String,
        payer: Option<String>,
    },
}

impl VerifyResponse {
    pub fn valid<P: Into<String>>(payer: P) -> Self {
        VerifyResponse::Valid {
            payer: payer.into(),
        }
    }

    pub fn invalid(reason: ErrorReason, payer: Option<String>) -> Self {
        VerifyResponse::Invalid {
            reason: reason.into(),
            payer,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, VerifyResponse::Valid { .. })
    }

    pub fn payer(&self) -> Option<&str> {
        match self {
            VerifyResponse::Valid { payer } => Some(payer),
            VerifyResponse::Invalid { payer, .. } => payer.as_deref(),
        }
    }

    pub fn invalid_reason(&self) -> Option<&str> {
        match self {
            VerifyResponse::Valid { .. } => None,
            VerifyResponse::Invalid { reason, .. } => Some(reason),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponseWire {
    is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invalid_reason: Option<String>,
}

impl Serialize for VerifyResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let wire = match self {
            VerifyResponse::Valid { payer } => VerifyResponseWire {
                is_valid: true,
                payer: Some(payer.clone()),
                invalid_reason: None,
            },
            VerifyResponse::Invalid { reason, payer } => VerifyResponseWire {
                is_valid: false,
                payer: payer.clone(),
                invalid_reason: Some(reason.clone()),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VerifyResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = VerifyResponseWire::deserialize(deserializer)?;
        if wire.is_valid {
            let payer = wire
                .payer
                .ok_or_else(|| serde::de::Error::missing_field("payer"))?;
            Ok(VerifyResponse::Valid { payer })
        } else {
            let reason = wire
                .invalid_reason
                .ok_or_else(|| serde::de::Error::missing_field("invalidReason"))?;
            Ok(VerifyResponse::Invalid {
                reason,
                payer: wire.payer,
            })
        }
    }
}

/// Result of a settlement attempt.
///
/// `transaction` is the empty string whenever no on-chain action occurred;
/// failures after submission carry the transaction hash so operators can
/// inspect the reverted call.
#[derive(Debug, Clone, PartialEq)]
pub enum SettleResponse {
    Success {
        transaction: String,
        network: String,
        payer: Option<String>,
    },
    Error {
        reason: String,
        transaction: String,
        network: String,
        payer: Option<String>,
    },
}

impl SettleResponse {
    pub fn success<T: Into<String>, N: Into<String>>(
        transaction: T,
        network: N,
        payer: Option<String>,
    ) -> Self {
        SettleResponse::Success {
            transaction: transaction.into(),
            network: network.into(),
            payer,
        }
    }

    pub fn error<R: Into<String>, N: Into<String>>(
        reason: R,
        network: N,
        payer: Option<String>,
    ) -> Self {
        SettleResponse::Error {
            reason: reason.into(),
            transaction: String::new(),
            network: network.into(),
            payer,
        }
    }

    pub fn error_with_transaction<R: Into<String>, T: Into<String>, N: Into<String>>(
        reason: R,
        transaction: T,
        network: N,
        payer: Option<String>,
    ) -> Self {
        SettleResponse::Error {
            reason: reason.into(),
            transaction: transaction.into(),
            network: network.into(),
            payer,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SettleResponse::Success { .. })
    }

    pub fn transaction(&self) -> &str {
        match self {
            SettleResponse::Success { transaction, .. } => transaction,
            SettleResponse::Error { transaction, .. } => transaction,
        }
    }

    pub fn error_reason(&self) -> Option<&str> {
        match self {
            SettleResponse::Success { .. } => None,
            SettleResponse::Error { reason, .. } => Some(reason),
        }
    }

    pub fn payer(&self) -> Option<&str> {
        match self {
            SettleResponse::Success { payer, .. } => payer.as_deref(),
            SettleResponse::Error { payer, .. } => payer.as_deref(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleResponseWire {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_reason: Option<String>,
    transaction: String,
    network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payer: Option<String>,
}

impl Serialize for SettleResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let wire = match self {
            SettleResponse::Success {
                transaction,
                network,
                payer,
            } => SettleResponseWire {
                success: true,
                error_reason: None,
                transaction: transaction.clone(),
                network: network.clone(),
                payer: payer.clone(),
            },
            SettleResponse::Error {
                reason,
                transaction,
                network,
                payer,
            } => SettleResponseWire {
                success: false,
                error_reason: Some(reason.clone()),
                transaction: transaction.clone(),
                network: network.clone(),
                payer: payer.clone(),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SettleResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = SettleResponseWire::deserialize(deserializer)?;
        if wire.success {
            Ok(SettleResponse::Success {
                transaction: wire.transaction,
                network: wire.network,
                payer: wire.payer,
            })
        } else {
            let reason = wire
                .error_reason
                .ok_or_else(|| serde::de::Error::missing_field("errorReason"))?;
            Ok(SettleResponse::Error {
                reason,
                transaction: wire.transaction,
                network: wire.network,
                payer: wire.payer,
            })
        }
    }
}

/// One `(network, scheme)` capability advertised by `/supported`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedPaymentKind {
    pub network: ChainId,
    pub scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Aggregate `/supported` output: capability kinds plus signer addresses
/// grouped by caip family pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResponse {
    pub kinds: Vec<SupportedPaymentKind>,
    #[serde(default)]
    pub signers: BTreeMap<String, Vec<String>>,
}

/// Body of non-protocol error responses (malformed JSON, unknown session).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
