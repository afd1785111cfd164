//! EIP-155 chain support: the signer port consumed by the upto scheme and
//! its Alloy-backed production implementation.
//!
//! The [`Eip155Signer`] trait is the facilitator's seam to the chain: it
//! verifies EIP-712 permit signatures and submits the `permit` /
//! `transferFrom` calls that settlement needs, waiting for receipts. Scheme
//! handlers never talk to an RPC endpoint directly.

use alloy_network::{Ethereum, EthereumWallet, NetworkWallet};
use alloy_primitives::{Address, B256, Signature, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_signer::Signer as _;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{Eip712Domain, SolStruct, sol};
use async_trait::async_trait;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::chain::ChainId;
use crate::config::Eip155ChainConfig;

pub const EIP155_NAMESPACE: &str = "eip155";

/// The numeric chain reference of an `eip155:<id>` chain.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Eip155ChainReference(u64);

impl Eip155ChainReference {
    pub fn new(chain_id: u64) -> Self {
        Self(chain_id)
    }

    pub fn inner(&self) -> u64 {
        self.0
    }

    pub fn as_chain_id(&self) -> ChainId {
        ChainId::new(EIP155_NAMESPACE, self.0.to_string())
    }
}

impl Display for Eip155ChainReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Eip155ChainReference> for ChainId {
    fn from(value: Eip155ChainReference) -> Self {
        value.as_chain_id()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Eip155ChainReferenceFormatError {
    #[error("Invalid namespace {0}, expected eip155")]
    InvalidNamespace(String),
    #[error("Invalid eip155 chain reference {0}")]
    InvalidReference(String),
}

impl TryFrom<&ChainId> for Eip155ChainReference {
    type Error = Eip155ChainReferenceFormatError;

    fn try_from(value: &ChainId) -> Result<Self, Self::Error> {
        if value.namespace != EIP155_NAMESPACE {
            return Err(Eip155ChainReferenceFormatError::InvalidNamespace(
                value.namespace.clone(),
            ));
        }
        let chain_id: u64 = value.reference.parse().map_err(|_| {
            Eip155ChainReferenceFormatError::InvalidReference(value.reference.clone())
        })?;
        Ok(Eip155ChainReference(chain_id))
    }
}

sol! {
    /// EIP-2612 Permit message, signed off-chain by the payer.
    #[derive(Debug)]
    struct Permit {
        address owner;
        address spender;
        uint256 value;
        uint256 nonce;
        uint256 deadline;
    }
}

sol! {
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[sol(rpc)]
    contract IERC20Permit {
        function permit(address owner, address spender, uint256 value, uint256 deadline, uint8 v, bytes32 r, bytes32 s) external;
        function allowance(address owner, address spender) external view returns (uint256);
        function transferFrom(address from, address to, uint256 value) external returns (bool);
        function nonces(address owner) external view returns (uint256);
    }
}

/// Arguments of an on-chain `permit(owner, spender, value, deadline, v, r, s)` call.
#[derive(Debug, Clone)]
pub struct PermitCall {
    pub owner: Address,
    pub spender: Address,
    pub value: U256,
    pub deadline: U256,
    pub v: u8,
    pub r: B256,
    pub s: B256,
}

/// Outcome of an awaited transaction receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Success,
    Reverted,
}

/// The facilitator-level view of a mined transaction.
#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub transaction_hash: String,
    pub status: TxStatus,
}

impl TxReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == TxStatus::Success
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    /// Submission was rejected before the transaction was mined (revert on
    /// simulation, transport failure, nonce trouble).
    #[error("contract call failed: {0}")]
    Contract(String),
    /// The transaction was sent but the receipt never arrived.
    #[error("receipt unavailable: {0}")]
    Receipt(String),
}

/// Chain signer port for the EIP-155 upto scheme.
///
/// Implementations own their transaction nonce management and are shared
/// freely across tasks.
#[async_trait]
pub trait Eip155Signer: Send + Sync {
    /// Facilitator-side addresses paying gas on this chain.
    fn addresses(&self) -> Vec<Address>;

    /// Verifies an EIP-712 permit signature against `owner`.
    async fn verify_typed_data(
        &self,
        owner: Address,
        domain: &Eip712Domain,
        permit: &Permit,
        signature: &[u8],
    ) -> Result<bool, SignerError>;

    /// Submits `permit` on the token contract and awaits the receipt.
    async fn permit(&self, token: Address, call: PermitCall) -> Result<TxReceipt, SignerError>;

    /// Reads `allowance(owner, spender)` on the token contract.
    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, SignerError>;

    /// Submits `transferFrom(from, to, amount)` and awaits the receipt.
    async fn transfer_from(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<TxReceipt, SignerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum Eip155ProviderError {
    #[error("at least one signer key is required")]
    NoSigners,
    #[error("invalid signer key: {0}")]
    InvalidSignerKey(String),
    #[error(transparent)]
    ChainReference(#[from] Eip155ChainReferenceFormatError),
}

/// Production [`Eip155Signer`] backed by an Alloy HTTP provider with a local
/// key wallet.
#[derive(Debug, Clone)]
pub struct Eip155ChainProvider {
    chain: Eip155ChainReference,
    receipt_timeout: Duration,
    signer_addresses: Vec<Address>,
    inner: DynProvider,
}

impl Eip155ChainProvider {
    pub fn from_config(config: &Eip155ChainConfig) -> Result<Self, Eip155ProviderError> {
        let chain = Eip155ChainReference::try_from(&config.chain_id)?;
        let signers = config
            .signers
            .iter()
            .map(|key| {
                key.trim_start_matches("0x")
                    .parse::<PrivateKeySigner>()
                    .map(|s| s.with_chain_id(Some(chain.inner())))
                    .map_err(|e| Eip155ProviderError::InvalidSignerKey(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut signers = signers.into_iter();
        let first_signer = signers.next().ok_or(Eip155ProviderError::NoSigners)?;
        let mut wallet = EthereumWallet::from(first_signer);
        for signer in signers {
            wallet.register_signer(signer);
        }
        let signer_addresses =
            NetworkWallet::<Ethereum>::signer_addresses(&wallet).collect::<Vec<_>>();

        let inner = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(config.rpc_url.clone())
            .erased();

        tracing::info!(chain = %chain.as_chain_id(), signers = ?signer_addresses, "Initialized EVM provider");

        Ok(Self {
            chain,
            receipt_timeout: Duration::from_secs(config.receipt_timeout_secs),
            signer_addresses,
            inner,
        })
    }

    pub fn chain(&self) -> &Eip155ChainReference {
        &self.chain
    }

    pub fn inner(&self) -> &DynProvider {
        &self.inner
    }

    async fn await_receipt(
        &self,
        pending: alloy_provider::PendingTransactionBuilder<Ethereum>,
    ) -> Result<TxReceipt, SignerError> {
        let receipt = pending
            .with_timeout(Some(self.receipt_timeout))
            .get_receipt()
            .await
            .map_err(|e| SignerError::Receipt(e.to_string()))?;
        let status = if receipt.status() {
            TxStatus::Success
        } else {
            TxStatus::Reverted
        };
        Ok(TxReceipt {
            transaction_hash: receipt.transaction_hash.to_string(),
            status,
        })
    }
}

#[async_trait]
impl Eip155Signer for Eip155ChainProvider {
    fn addresses(&self) -> Vec<Address> {
        self.signer_addresses.clone()
    }

    async fn verify_typed_data(
        &self,
        owner: Address,
        domain: &Eip712Domain,
        permit: &Permit,
        signature: &[u8],
    ) -> Result<bool, SignerError> {
        let signature = match Signature::try_from(signature) {
            Ok(signature) => signature,
            Err(_) => return Ok(false),
        };
        let digest = permit.eip712_signing_hash(domain);
        let recovered = match signature.recover_address_from_prehash(&digest) {
            Ok(address) => address,
            Err(_) => return Ok(false),
        };
        Ok(recovered == owner)
    }

    async fn permit(&self, token: Address, call: PermitCall) -> Result<TxReceipt, SignerError> {
        let contract = IERC20Permit::new(token, self.inner.clone());
        let pending = contract
            .permit(
                call.owner,
                call.spender,
                call.value,
                call.deadline,
                call.v,
                call.r,
                call.s,
            )
            .send()
            .await
            .map_err(|e| SignerError::Contract(e.to_string()))?;
        self.await_receipt(pending).await
    }

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, SignerError> {
        let contract = IERC20Permit::new(token, self.inner.clone());
        contract
            .allowance(owner, spender)
            .call()
            .await
            .map_err(|e| SignerError::Contract(e.to_string()))
    }

    async fn transfer_from(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<TxReceipt, SignerError> {
        let contract = IERC20Permit::new(token, self.inner.clone());
        let pending = contract
            .transferFrom(from, to, amount)
            .send()
            .await
            .map_err(|e| SignerError::Contract(e.to_string()))?;
        self.await_receipt(pending).await
    }
}
