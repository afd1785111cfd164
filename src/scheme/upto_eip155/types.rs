//! Typed view of the EIP-155 "upto" scheme payload.
//!
//! The payment envelope keeps `payload` as raw JSON; this module extracts
//! the EIP-2612 authorization from it at handler entry. Integer fields
//! cross the wire as decimal strings and are parsed leniently: an
//! unparseable value becomes zero, which then fails the cap or deadline
//! comparison downstream instead of rejecting the envelope outright.

use alloy_primitives::{Address, U256, hex};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::{Display, Formatter};

use crate::proto::{PaymentPayload, PaymentRequirements};
use crate::timestamp::UnixTimestamp;

pub const UPTO_SCHEME: &str = "upto";

/// A big integer that deserializes from a decimal string or JSON number,
/// saturating to zero when the input does not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecimalU256(pub U256);

impl DecimalU256 {
    pub fn parse(input: &str) -> Self {
        let value = U256::from_str_radix(input.trim(), 10).unwrap_or(U256::ZERO);
        Self(value)
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }

    /// The value clamped into `u64`, for timestamp arithmetic.
    pub fn as_u64_saturating(&self) -> u64 {
        u64::try_from(self.0).unwrap_or(u64::MAX)
    }
}

impl From<U256> for DecimalU256 {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl Display for DecimalU256 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for DecimalU256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for DecimalU256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let parsed = match &value {
            serde_json::Value::String(s) => Self::parse(s),
            serde_json::Value::Number(n) => {
                Self(n.as_u64().map(U256::from).unwrap_or(U256::ZERO))
            }
            _ => Self(U256::ZERO),
        };
        Ok(parsed)
    }
}

/// The scheme-specific material of an upto payment: an EIP-2612 permit
/// authorization plus its detached signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UptoEvmPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<UptoEvmAuthorization>,
}

impl UptoEvmPayload {
    /// Extracts the typed view from the generic payment envelope.
    pub fn from_envelope(payload: &PaymentPayload) -> Option<Self> {
        serde_json::from_value(payload.payload.clone()).ok()
    }

    /// The raw signature bytes, or empty when the hex does not decode.
    pub fn signature_bytes(&self) -> Vec<u8> {
        self.signature
            .as_deref()
            .map(|s| hex::decode(s.trim_start_matches("0x")).unwrap_or_default())
            .unwrap_or_default()
    }
}

/// EIP-2612 permit authorization: who may spend how much, until when.
///
/// All fields are optional at the wire level; presence is validated by the
/// handler so a missing field maps to the `invalid_upto_evm_payload` tag
/// rather than a deserialization error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UptoEvmAuthorization {
    /// Token owner (the payer).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Spender; falls back to the requirements' `payTo` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Spending cap, immutable for the session's lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<DecimalU256>,
    /// EIP-2612 nonce read from the token contract.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<DecimalU256>,
    /// Permit deadline, seconds since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_before: Option<DecimalU256>,
}

impl UptoEvmAuthorization {
    /// Best-effort payer address, reported even on verification failure.
    pub fn payer(&self) -> Option<Address> {
        parse_address(self.from.as_deref()?)
    }
}

/// EIP-712 domain hints and cap constraints carried in
/// `requirements.extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UptoRequirementsExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount_required: Option<DecimalU256>,
    /// Legacy alias of `maxAmountRequired`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<DecimalU256>,
}

impl UptoRequirementsExtra {
    pub fn from_requirements(requirements: &PaymentRequirements) -> Option<Self> {
        let extra = requirements.extra.clone()?;
        serde_json::from_value(extra).ok()
    }

    /// The advertised maximum the cap must cover, if any.
    pub fn required_max(&self) -> Option<U256> {
        self.max_amount_required
            .or(self.max_amount)
            .map(|v| v.as_u256())
    }
}

/// The session-relevant terms of a verified upto authorization.
#[derive(Debug, Clone, Copy)]
pub struct UptoTerms {
    pub payer: Address,
    pub cap: U256,
    pub deadline: UnixTimestamp,
}

/// Derives cap and deadline from the authorization inside a payment
/// envelope. Used by the session engine when admitting a new session.
pub fn session_terms(payload: &PaymentPayload) -> Option<UptoTerms> {
    let view = UptoEvmPayload::from_envelope(payload)?;
    let authorization = view.authorization?;
    let payer = authorization.payer()?;
    let cap = authorization.value?.as_u256();
    let deadline = UnixTimestamp::from_secs(authorization.valid_before?.as_u64_saturating());
    Some(UptoTerms {
        payer,
        cap,
        deadline,
    })
}

pub(crate) fn parse_address(input: &str) -> Option<Address> {
    input.trim().parse::<Address>().ok()
}
