//! EIP-155 "upto" payment scheme.
//!
//! A single EIP-2612 permit authorizes spending up to a cap; the facilitator
//! accrues metered charges server-side and settles them in batches. Where
//! the "exact" scheme settles each payment immediately, settlement here
//! applies the permit once and then draws the approved allowance down with
//! `transferFrom` calls, one per batch.
//!
//! The permit-then-fallback design in [`settle`](UptoEip155Handler::settle)
//! handles repeated settlements against the same authorization: the permit
//! is nonce-consuming and single-use, so a second settlement sees the permit
//! revert and proceeds on the allowance left behind by the first.

pub mod types;

use alloy_primitives::{Address, B256, Signature};
use alloy_sol_types::eip712_domain;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::instrument;

use crate::chain::eip155::{Eip155ChainReference, Eip155Signer, Permit, PermitCall};
use crate::chain::{ChainId, ChainIdPattern};
use crate::proto::{
    ErrorReason, PaymentPayload, PaymentRequirements, SettleResponse, VerifyResponse,
};
use crate::scheme::{SchemeHandler, SchemeHandlerError};
use crate::timestamp::UnixTimestamp;

use types::{DecimalU256, UPTO_SCHEME, UptoEvmPayload, UptoRequirementsExtra, parse_address};

/// Minimum remaining permit lifetime at verification time, absorbing the
/// latency between verification and on-chain submission.
const DEADLINE_GRACE_SECS: u64 = 6;

/// Upto scheme handler for one EIP-155 chain.
pub struct UptoEip155Handler<S> {
    chain: Eip155ChainReference,
    signer: Arc<S>,
}

impl<S> UptoEip155Handler<S> {
    pub fn new(chain: Eip155ChainReference, signer: Arc<S>) -> Self {
        Self { chain, signer }
    }

    pub fn chain(&self) -> &Eip155ChainReference {
        &self.chain
    }
}

#[async_trait]
impl<S> SchemeHandler for UptoEip155Handler<S>
where
    S: Eip155Signer + 'static,
{
    fn scheme(&self) -> &str {
        UPTO_SCHEME
    }

    fn caip_family(&self) -> ChainIdPattern {
        ChainIdPattern::wildcard(crate::chain::eip155::EIP155_NAMESPACE)
    }

    fn extra(&self, _network: &ChainId) -> Option<serde_json::Value> {
        None
    }

    fn signers(&self, _network: &ChainId) -> Vec<String> {
        self.signer
            .addresses()
            .iter()
            .map(|a| a.to_checksum(None))
            .collect()
    }

    #[instrument(skip_all, fields(network = %requirements.network))]
    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, SchemeHandlerError> {
        verify_upto_payment(self.signer.as_ref(), payload, requirements).await
    }

    #[instrument(skip_all, fields(network = %requirements.network, amount = %requirements.amount))]
    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, SchemeHandlerError> {
        settle_upto_payment(self.signer.as_ref(), payload, requirements).await
    }
}

/// Runs the upto verification check sequence, returning on the first
/// failure with its tagged reason. The payer is attached best-effort once
/// the authorization parses.
async fn verify_upto_payment<S: Eip155Signer>(
    signer: &S,
    payload: &PaymentPayload,
    requirements: &PaymentRequirements,
) -> Result<VerifyResponse, SchemeHandlerError> {
    if payload.accepted.scheme != UPTO_SCHEME || requirements.scheme != UPTO_SCHEME {
        return Ok(VerifyResponse::invalid(ErrorReason::UnsupportedScheme, None));
    }

    let Some(view) = UptoEvmPayload::from_envelope(payload) else {
        return Ok(VerifyResponse::invalid(
            ErrorReason::InvalidUptoEvmPayload,
            None,
        ));
    };
    let payer = view
        .authorization
        .as_ref()
        .and_then(|a| a.payer())
        .map(|a| a.to_checksum(None));

    let (Some(authorization), Some(signature)) =
        (view.authorization.as_ref(), view.signature.as_deref())
    else {
        return Ok(VerifyResponse::invalid(
            ErrorReason::InvalidUptoEvmPayload,
            payer,
        ));
    };
    if signature.trim().is_empty() {
        return Ok(VerifyResponse::invalid(
            ErrorReason::InvalidUptoEvmPayload,
            payer,
        ));
    }

    let Some(owner) = authorization.from.as_deref().and_then(parse_address) else {
        return Ok(VerifyResponse::invalid(
            ErrorReason::InvalidUptoEvmPayload,
            payer,
        ));
    };
    let spender_source = authorization
        .to
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(&requirements.pay_to);
    let Some(spender) = parse_address(spender_source) else {
        return Ok(VerifyResponse::invalid(
            ErrorReason::InvalidUptoEvmPayload,
            payer,
        ));
    };
    let (Some(value), Some(nonce), Some(valid_before)) = (
        authorization.value,
        authorization.nonce,
        authorization.valid_before,
    ) else {
        return Ok(VerifyResponse::invalid(
            ErrorReason::InvalidUptoEvmPayload,
            payer,
        ));
    };

    if payload.accepted.network != requirements.network {
        return Ok(VerifyResponse::invalid(
            ErrorReason::NetworkMismatch,
            payer,
        ));
    }

    let extra = UptoRequirementsExtra::from_requirements(requirements);
    let domain_hints = extra.as_ref().and_then(|e| {
        let name = e.name.as_deref().filter(|s| !s.is_empty())?;
        let version = e.version.as_deref().filter(|s| !s.is_empty())?;
        Some((name, version))
    });
    let Some((name, version)) = domain_hints else {
        return Ok(VerifyResponse::invalid(
            ErrorReason::MissingEip712Domain,
            payer,
        ));
    };

    match parse_address(&requirements.pay_to) {
        Some(pay_to) if pay_to == spender => {}
        _ => {
            return Ok(VerifyResponse::invalid(
                ErrorReason::RecipientMismatch,
                payer,
            ));
        }
    }

    let cap = value.as_u256();
    let amount = DecimalU256::parse(&requirements.amount).as_u256();
    if cap < amount {
        return Ok(VerifyResponse::invalid(ErrorReason::CapTooLow, payer));
    }
    if let Some(required_max) = extra.as_ref().and_then(|e| e.required_max()) {
        if cap < required_max {
            return Ok(VerifyResponse::invalid(
                ErrorReason::CapBelowRequiredMax,
                payer,
            ));
        }
    }

    let deadline = UnixTimestamp::from_secs(valid_before.as_u64_saturating());
    if deadline < UnixTimestamp::now() + DEADLINE_GRACE_SECS {
        return Ok(VerifyResponse::invalid(
            ErrorReason::AuthorizationExpired,
            payer,
        ));
    }

    let Ok(chain) = Eip155ChainReference::try_from(&requirements.network) else {
        return Ok(VerifyResponse::invalid(ErrorReason::InvalidChainId, payer));
    };

    // An unparseable asset keeps the lenient policy: the domain then binds a
    // zero contract and signature verification fails below.
    let asset = parse_address(&requirements.asset).unwrap_or(Address::ZERO);
    let domain = eip712_domain! {
        name: name.to_string(),
        version: version.to_string(),
        chain_id: chain.inner(),
        verifying_contract: asset,
    };
    let permit = Permit {
        owner,
        spender,
        value: cap,
        nonce: nonce.as_u256(),
        deadline: valid_before.as_u256(),
    };

    let signature_valid = signer
        .verify_typed_data(owner, &domain, &permit, &view.signature_bytes())
        .await?;
    if !signature_valid {
        return Ok(VerifyResponse::invalid(
            ErrorReason::InvalidPermitSignature,
            payer,
        ));
    }

    Ok(VerifyResponse::valid(owner.to_checksum(None)))
}

/// Settles a batched upto amount: re-verify, apply the permit, fall back to
/// the standing allowance when the permit was already consumed, then
/// `transferFrom` the batch to the recipient.
async fn settle_upto_payment<S: Eip155Signer>(
    signer: &S,
    payload: &PaymentPayload,
    requirements: &PaymentRequirements,
) -> Result<SettleResponse, SchemeHandlerError> {
    let network = requirements.network.to_string();

    let verified = verify_upto_payment(signer, payload, requirements).await?;
    let payer = verified.payer().map(str::to_string);
    if let Some(reason) = verified.invalid_reason() {
        return Ok(SettleResponse::error(reason.to_string(), network, payer));
    }

    let Some(view) = UptoEvmPayload::from_envelope(payload) else {
        return Ok(SettleResponse::error(
            ErrorReason::InvalidUptoEvmPayload,
            network,
            payer,
        ));
    };
    let Some(authorization) = view.authorization.as_ref() else {
        return Ok(SettleResponse::error(
            ErrorReason::InvalidUptoEvmPayload,
            network,
            payer,
        ));
    };
    let terms = (
        authorization.from.as_deref().and_then(parse_address),
        authorization.value,
        authorization.valid_before,
    );
    let (Some(owner), Some(value), Some(valid_before)) = terms else {
        return Ok(SettleResponse::error(
            ErrorReason::InvalidUptoEvmPayload,
            network,
            payer,
        ));
    };
    let spender_source = authorization
        .to
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(&requirements.pay_to);
    let Some(spender) = parse_address(spender_source) else {
        return Ok(SettleResponse::error(
            ErrorReason::InvalidUptoEvmPayload,
            network,
            payer,
        ));
    };

    let cap = value.as_u256();
    let amount = DecimalU256::parse(&requirements.amount).as_u256();
    if amount > cap {
        return Ok(SettleResponse::error(
            ErrorReason::TotalExceedsCap,
            network,
            payer,
        ));
    }

    let signature_bytes = view.signature_bytes();
    let Ok(signature) = Signature::try_from(signature_bytes.as_slice()) else {
        return Ok(SettleResponse::error(
            ErrorReason::UnsupportedSignatureType,
            network,
            payer,
        ));
    };
    let v = 27 + signature.v() as u8;
    let r = B256::from(signature.r().to_be_bytes::<32>());
    let s = B256::from(signature.s().to_be_bytes::<32>());

    let token = parse_address(&requirements.asset).unwrap_or(Address::ZERO);

    let permit_applied = match signer
        .permit(
            token,
            PermitCall {
                owner,
                spender,
                value: cap,
                deadline: valid_before.as_u256(),
                v,
                r,
                s,
            },
        )
        .await
    {
        Ok(receipt) if receipt.succeeded() => true,
        Ok(receipt) => {
            tracing::warn!(
                transaction = %receipt.transaction_hash,
                "Permit reverted, checking existing allowance"
            );
            false
        }
        Err(error) => {
            tracing::warn!(%error, "Permit submission failed, checking existing allowance");
            false
        }
    };

    if !permit_applied {
        let allowance = match signer.allowance(token, owner, spender).await {
            Ok(allowance) => allowance,
            Err(error) => {
                tracing::warn!(%error, "Failed to check allowance after permit failure");
                return Ok(SettleResponse::error(
                    ErrorReason::PermitFailed,
                    network,
                    payer,
                ));
            }
        };
        if allowance < amount {
            tracing::warn!(%allowance, required = %amount, "Allowance insufficient after permit failure");
            return Ok(SettleResponse::error(
                ErrorReason::InsufficientAllowance,
                network,
                payer,
            ));
        }
        tracing::info!("Permit already applied, proceeding with existing allowance");
    }

    let receipt = match signer.transfer_from(token, owner, spender, amount).await {
        Ok(receipt) => receipt,
        Err(error) => {
            tracing::warn!(%error, "transferFrom failed");
            return Ok(SettleResponse::error(
                ErrorReason::TransactionFailed,
                network,
                payer,
            ));
        }
    };
    if !receipt.succeeded() {
        return Ok(SettleResponse::error_with_transaction(
            ErrorReason::InvalidTransactionState,
            receipt.transaction_hash,
            network,
            payer,
        ));
    }

    Ok(SettleResponse::success(
        receipt.transaction_hash,
        network,
        payer,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::eip155::{SignerError, TxReceipt, TxStatus};
    use crate::proto::X402Version2;
    use alloy_primitives::{U256, address};
    use alloy_sol_types::Eip712Domain;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const OWNER: Address = address!("0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
    const PAY_TO: Address = address!("0xBBbBBBBbbBBBbbbBbbBbbbbBBbBbbbbBbBbbBBbB");
    const OTHER: Address = address!("0xCcCCccccCCCCcCCCCCCcCcCccCcCCCcCcccccccC");
    const ASSET: Address = address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");

    // 65 bytes: r || s || v, with v = 27.
    const SIGNATURE: &str = concat!(
        "0x",
        "1111111111111111111111111111111111111111111111111111111111111111",
        "2222222222222222222222222222222222222222222222222222222222222222",
        "1b"
    );

    struct MockSigner {
        verify_result: bool,
        permits: Mutex<VecDeque<Result<TxReceipt, SignerError>>>,
        allowances: Mutex<VecDeque<Result<U256, SignerError>>>,
        transfers: Mutex<VecDeque<Result<TxReceipt, SignerError>>>,
        permit_calls: Mutex<Vec<PermitCall>>,
        transfer_calls: Mutex<Vec<(Address, Address, Address, U256)>>,
        verified_permits: Mutex<Vec<(Address, Address, U256)>>,
    }

    impl MockSigner {
        fn new() -> Self {
            Self {
                verify_result: true,
                permits: Mutex::new(VecDeque::new()),
                allowances: Mutex::new(VecDeque::new()),
                transfers: Mutex::new(VecDeque::new()),
                permit_calls: Mutex::new(Vec::new()),
                transfer_calls: Mutex::new(Vec::new()),
                verified_permits: Mutex::new(Vec::new()),
            }
        }

        fn rejecting_signatures() -> Self {
            Self {
                verify_result: false,
                ..Self::new()
            }
        }

        fn queue_permit(&self, result: Result<TxReceipt, SignerError>) {
            self.permits.lock().unwrap().push_back(result);
        }

        fn queue_allowance(&self, result: Result<U256, SignerError>) {
            self.allowances.lock().unwrap().push_back(result);
        }

        fn queue_transfer(&self, result: Result<TxReceipt, SignerError>) {
            self.transfers.lock().unwrap().push_back(result);
        }

        fn receipt(hash: &str, status: TxStatus) -> TxReceipt {
            TxReceipt {
                transaction_hash: hash.to_string(),
                status,
            }
        }
    }

    #[async_trait]
    impl Eip155Signer for MockSigner {
        fn addresses(&self) -> Vec<Address> {
            vec![OTHER]
        }

        async fn verify_typed_data(
            &self,
            owner: Address,
            _domain: &Eip712Domain,
            permit: &Permit,
            _signature: &[u8],
        ) -> Result<bool, SignerError> {
            self.verified_permits
                .lock()
                .unwrap()
                .push((owner, permit.spender, permit.value));
            Ok(self.verify_result)
        }

        async fn permit(
            &self,
            _token: Address,
            call: PermitCall,
        ) -> Result<TxReceipt, SignerError> {
            self.permit_calls.lock().unwrap().push(call);
            self.permits
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Self::receipt("0xpermit", TxStatus::Success)))
        }

        async fn allowance(
            &self,
            _token: Address,
            _owner: Address,
            _spender: Address,
        ) -> Result<U256, SignerError> {
            self.allowances
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(U256::ZERO))
        }

        async fn transfer_from(
            &self,
            token: Address,
            from: Address,
            to: Address,
            amount: U256,
        ) -> Result<TxReceipt, SignerError> {
            self.transfer_calls
                .lock()
                .unwrap()
                .push((token, from, to, amount));
            self.transfers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Self::receipt("0xtransfer", TxStatus::Success)))
        }
    }

    fn requirements() -> PaymentRequirements {
        PaymentRequirements {
            scheme: "upto".to_string(),
            network: "eip155:8453".parse().unwrap(),
            asset: ASSET.to_checksum(None),
            pay_to: PAY_TO.to_checksum(None),
            amount: "250000".to_string(),
            max_timeout_seconds: 300,
            extra: Some(serde_json::json!({"name": "USD Coin", "version": "2"})),
        }
    }

    fn authorization(valid_before: u64) -> serde_json::Value {
        serde_json::json!({
            "from": OWNER.to_checksum(None),
            "to": PAY_TO.to_checksum(None),
            "value": "1000000",
            "nonce": "0",
            "validBefore": valid_before.to_string(),
        })
    }

    fn payload_with(authorization: serde_json::Value, requirements: &PaymentRequirements) -> PaymentPayload {
        PaymentPayload {
            x402_version: X402Version2,
            resource: None,
            extensions: vec![],
            accepted: requirements.clone(),
            payload: serde_json::json!({
                "signature": SIGNATURE,
                "authorization": authorization,
            }),
        }
    }

    fn payload(requirements: &PaymentRequirements) -> PaymentPayload {
        let valid_before = UnixTimestamp::now().as_secs() + 3600;
        payload_with(authorization(valid_before), requirements)
    }

    #[tokio::test]
    async fn verifies_happy_path_payment() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let payload = payload(&requirements);

        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert!(response.is_valid());
        assert_eq!(response.payer(), Some(OWNER.to_checksum(None).as_str()));

        let verified = signer.verified_permits.lock().unwrap();
        assert_eq!(verified.as_slice(), &[(OWNER, PAY_TO, U256::from(1_000_000u64))]);
    }

    #[tokio::test]
    async fn rejects_non_upto_scheme() {
        let signer = MockSigner::new();
        let mut requirements = requirements();
        requirements.scheme = "exact".to_string();
        let mut payload = payload(&requirements);
        payload.accepted.scheme = "exact".to_string();

        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.invalid_reason(), Some("unsupported_scheme"));
    }

    #[tokio::test]
    async fn rejects_missing_authorization() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let mut payload = payload(&requirements);
        payload.payload = serde_json::json!({"signature": SIGNATURE});

        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.invalid_reason(), Some("invalid_upto_evm_payload"));
        assert_eq!(response.payer(), None);
    }

    #[tokio::test]
    async fn rejects_missing_signature_with_best_effort_payer() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let valid_before = UnixTimestamp::now().as_secs() + 3600;
        let mut payload = payload_with(authorization(valid_before), &requirements);
        payload.payload = serde_json::json!({"authorization": authorization(valid_before)});

        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.invalid_reason(), Some("invalid_upto_evm_payload"));
        assert_eq!(response.payer(), Some(OWNER.to_checksum(None).as_str()));
    }

    #[tokio::test]
    async fn rejects_missing_value_field() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let valid_before = UnixTimestamp::now().as_secs() + 3600;
        let mut authorization = authorization(valid_before);
        authorization.as_object_mut().unwrap().remove("value");
        let payload = payload_with(authorization, &requirements);

        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.invalid_reason(), Some("invalid_upto_evm_payload"));
    }

    #[tokio::test]
    async fn spender_falls_back_to_pay_to() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let valid_before = UnixTimestamp::now().as_secs() + 3600;
        let mut authorization = authorization(valid_before);
        authorization.as_object_mut().unwrap().remove("to");
        let payload = payload_with(authorization, &requirements);

        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert!(response.is_valid());
    }

    #[tokio::test]
    async fn rejects_network_mismatch() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let mut payload = payload(&requirements);
        payload.accepted.network = "eip155:1".parse().unwrap();

        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.invalid_reason(), Some("network_mismatch"));
    }

    #[tokio::test]
    async fn rejects_missing_eip712_domain() {
        let signer = MockSigner::new();

        let mut without_version = requirements();
        without_version.extra = Some(serde_json::json!({"name": "USD Coin"}));
        let payload1 = payload(&without_version);
        let response = verify_upto_payment(&signer, &payload1, &without_version)
            .await
            .unwrap();
        assert_eq!(response.invalid_reason(), Some("missing_eip712_domain"));

        let mut without_extra = requirements();
        without_extra.extra = None;
        let payload = payload(&without_extra);
        let response = verify_upto_payment(&signer, &payload, &without_extra)
            .await
            .unwrap();
        assert_eq!(response.invalid_reason(), Some("missing_eip712_domain"));
    }

    #[tokio::test]
    async fn rejects_recipient_mismatch_with_payer() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let valid_before = UnixTimestamp::now().as_secs() + 3600;
        let mut authorization = authorization(valid_before);
        authorization["to"] = serde_json::json!(OTHER.to_checksum(None));
        let payload = payload_with(authorization, &requirements);

        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.invalid_reason(), Some("recipient_mismatch"));
        assert_eq!(response.payer(), Some(OWNER.to_checksum(None).as_str()));
    }

    #[tokio::test]
    async fn spender_comparison_is_checksum_insensitive() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let valid_before = UnixTimestamp::now().as_secs() + 3600;
        let mut authorization = authorization(valid_before);
        authorization["to"] = serde_json::json!(PAY_TO.to_string().to_lowercase());
        let payload = payload_with(authorization, &requirements);

        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert!(response.is_valid());
    }

    #[tokio::test]
    async fn cap_boundary_is_inclusive() {
        let signer = MockSigner::new();
        let mut requirements = requirements();
        requirements.amount = "1000000".to_string();
        let payload1 = payload(&requirements);
        let response = verify_upto_payment(&signer, &payload1, &requirements)
            .await
            .unwrap();
        assert!(response.is_valid());

        requirements.amount = "1000001".to_string();
        let payload = payload(&requirements);
        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.invalid_reason(), Some("cap_too_low"));
    }

    #[tokio::test]
    async fn rejects_cap_below_required_max() {
        let signer = MockSigner::new();
        let mut requirements = requirements();
        requirements.extra = Some(serde_json::json!({
            "name": "USD Coin",
            "version": "2",
            "maxAmountRequired": "2000000",
        }));
        let payload = payload(&requirements);

        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.invalid_reason(), Some("cap_below_required_max"));
    }

    #[tokio::test]
    async fn honors_legacy_max_amount_alias() {
        let signer = MockSigner::new();
        let mut requirements = requirements();
        requirements.extra = Some(serde_json::json!({
            "name": "USD Coin",
            "version": "2",
            "maxAmount": "2000000",
        }));
        let payload = payload(&requirements);

        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.invalid_reason(), Some("cap_below_required_max"));
    }

    #[tokio::test]
    async fn deadline_boundary_at_six_seconds() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let now = UnixTimestamp::now().as_secs();

        let payload = payload_with(authorization(now + 5), &requirements);
        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.invalid_reason(), Some("authorization_expired"));

        let payload = payload_with(authorization(now + 7), &requirements);
        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert!(response.is_valid());
    }

    #[tokio::test]
    async fn rejects_unparseable_chain_reference() {
        let signer = MockSigner::new();
        let mut requirements = requirements();
        requirements.network = "eip155:base".parse().unwrap();
        let mut payload = payload(&requirements);
        payload.accepted.network = requirements.network.clone();

        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.invalid_reason(), Some("invalid_chain_id"));
    }

    #[tokio::test]
    async fn rejects_invalid_permit_signature() {
        let signer = MockSigner::rejecting_signatures();
        let requirements = requirements();
        let payload = payload(&requirements);

        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.invalid_reason(), Some("invalid_permit_signature"));
        assert_eq!(response.payer(), Some(OWNER.to_checksum(None).as_str()));
    }

    #[tokio::test]
    async fn garbage_cap_saturates_to_zero_and_fails_amount_check() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let valid_before = UnixTimestamp::now().as_secs() + 3600;
        let mut authorization = authorization(valid_before);
        authorization["value"] = serde_json::json!("one million");
        let payload = payload_with(authorization, &requirements);

        let response = verify_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.invalid_reason(), Some("cap_too_low"));
    }

    #[tokio::test]
    async fn settles_happy_path() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let payload = payload(&requirements);

        let response = settle_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.transaction(), "0xtransfer");
        assert_eq!(response.payer(), Some(OWNER.to_checksum(None).as_str()));

        let permits = signer.permit_calls.lock().unwrap();
        assert_eq!(permits.len(), 1);
        assert_eq!(permits[0].owner, OWNER);
        assert_eq!(permits[0].spender, PAY_TO);
        assert_eq!(permits[0].value, U256::from(1_000_000u64));
        assert_eq!(permits[0].v, 27);

        let transfers = signer.transfer_calls.lock().unwrap();
        assert_eq!(transfers.as_slice(), &[(ASSET, OWNER, PAY_TO, U256::from(250_000u64))]);
    }

    #[tokio::test]
    async fn settle_reverifies_before_touching_the_chain() {
        let signer = MockSigner::new();
        let mut requirements = requirements();
        requirements.amount = "1000001".to_string();
        let payload = payload(&requirements);

        let response = settle_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.error_reason(), Some("cap_too_low"));
        assert!(signer.permit_calls.lock().unwrap().is_empty());
        assert!(signer.transfer_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn settle_carries_verify_failure_reason() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let valid_before = UnixTimestamp::now().as_secs() + 3600;
        let mut authorization = authorization(valid_before);
        authorization["to"] = serde_json::json!(OTHER.to_checksum(None));
        let payload = payload_with(authorization, &requirements);

        let response = settle_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.error_reason(), Some("recipient_mismatch"));
        assert_eq!(response.transaction(), "");
        assert!(signer.permit_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn settle_falls_back_to_allowance_on_permit_replay() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let payload = payload(&requirements);

        // First settlement: permit applies, transfer succeeds.
        let first = settle_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert!(first.is_success());

        // Second settlement: the permit nonce is consumed, the standing
        // allowance covers the batch.
        signer.queue_permit(Err(SignerError::Contract("permit reverted".into())));
        signer.queue_allowance(Ok(U256::from(750_000u64)));
        let second = settle_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert!(second.is_success());
        assert_eq!(signer.transfer_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn settle_reports_insufficient_allowance() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let payload = payload(&requirements);

        signer.queue_permit(Err(SignerError::Contract("permit reverted".into())));
        signer.queue_allowance(Ok(U256::from(100u64)));
        let response = settle_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.error_reason(), Some("insufficient_allowance"));
        assert!(signer.transfer_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn settle_reports_permit_failed_when_allowance_unreadable() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let payload = payload(&requirements);

        signer.queue_permit(Err(SignerError::Contract("permit reverted".into())));
        signer.queue_allowance(Err(SignerError::Contract("rpc down".into())));
        let response = settle_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.error_reason(), Some("permit_failed"));
    }

    #[tokio::test]
    async fn settle_reverted_permit_receipt_triggers_fallback() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let payload = payload(&requirements);

        signer.queue_permit(Ok(MockSigner::receipt("0xdead", TxStatus::Reverted)));
        signer.queue_allowance(Ok(U256::from(1_000_000u64)));
        let response = settle_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn settle_reports_reverted_transfer_with_hash() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let payload = payload(&requirements);

        signer.queue_transfer(Ok(MockSigner::receipt("0xbadbeef", TxStatus::Reverted)));
        let response = settle_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.error_reason(), Some("invalid_transaction_state"));
        assert_eq!(response.transaction(), "0xbadbeef");
    }

    #[tokio::test]
    async fn settle_reports_transaction_failed_on_submission_error() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let payload = payload(&requirements);

        signer.queue_transfer(Err(SignerError::Contract("rpc down".into())));
        let response = settle_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.error_reason(), Some("transaction_failed"));
        assert_eq!(response.transaction(), "");
    }

    #[tokio::test]
    async fn settle_rejects_malformed_signature_bytes() {
        let signer = MockSigner::new();
        let requirements = requirements();
        let valid_before = UnixTimestamp::now().as_secs() + 3600;
        let mut payload = payload_with(authorization(valid_before), &requirements);
        payload.payload["signature"] = serde_json::json!("0x1b2c");

        let response = settle_upto_payment(&signer, &payload, &requirements)
            .await
            .unwrap();
        assert_eq!(response.error_reason(), Some("unsupported_signature_type"));
    }

    #[tokio::test]
    async fn handler_reports_scheme_and_family() {
        let signer = Arc::new(MockSigner::new());
        let handler = UptoEip155Handler::new(Eip155ChainReference::new(8453), signer);
        assert_eq!(handler.scheme(), "upto");
        assert_eq!(handler.caip_family().to_string(), "eip155:*");
        let network = ChainId::eip155(8453);
        assert_eq!(handler.signers(&network), vec![OTHER.to_checksum(None)]);
    }
}
