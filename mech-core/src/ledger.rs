//! The ledger seam: reading contract state, submitting signed transactions and fetching
//! their receipts and logs.
//!
//! Nonce allocation belongs to the gateway. Implementations must not hand out a nonce for
//! a sender while an earlier submission from the same sender is still unacknowledged.
//! Proxy wallet nonces are the delegated executor's concern.

use alloy_primitives::{Address, B256, Bytes, Signature, TxHash, U256};
use alloy_signer::{Error as AlloySignerError, Signer as AlloySigner};
use bon::Builder;

use crate::errors::LedgerError;

/// Key material able to sign 32-byte digests.
///
/// Implemented for every [`alloy_signer::Signer`]; implement it directly for signers that
/// live elsewhere (hardware wallets, remote signing services).
pub trait KeySigner {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Address of the key.
    fn address(&self) -> Address;

    fn sign_hash(&self, hash: &B256) -> impl Future<Output = Result<Signature, Self::Error>>;
}

impl<S: AlloySigner> KeySigner for S {
    type Error = AlloySignerError;

    fn address(&self) -> Address {
        AlloySigner::address(self)
    }

    async fn sign_hash(&self, hash: &B256) -> Result<Signature, Self::Error> {
        AlloySigner::sign_hash(self, hash).await
    }
}

/// A contract call with its attached value and ABI-encoded calldata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

impl ContractCall {
    pub fn new(to: Address, data: impl Into<Bytes>) -> Self {
        ContractCall {
            to,
            value: U256::ZERO,
            data: data.into(),
        }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    /// The 4-byte function selector, if the calldata carries one.
    pub fn selector(&self) -> Option<[u8; 4]> {
        self.data.get(..4).map(|s| [s[0], s[1], s[2], s[3]])
    }
}

/// Gas settings for a submission. Unset fields are filled in by the gateway.
#[derive(Builder, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxParams {
    pub gas_limit: Option<u64>,
    pub gas_price: Option<u128>,
}

/// One emitted log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub tx_hash: Option<TxHash>,
}

/// Log filter: one emitter, optionally one event signature, optionally a start block.
#[derive(Builder, Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub address: Address,
    pub topic0: Option<B256>,
    pub from_block: Option<u64>,
}

/// A mined, successful transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// Not mined yet.
    Pending,
    Success(Receipt),
    /// Mined but reverted, with the revert reason when the node reports one.
    Reverted { reason: Option<String> },
}

/// Access to chain state and transaction submission.
pub trait LedgerGateway {
    /// Execute a read-only call against current state and return the raw return data.
    fn read(&self, call: &ContractCall) -> impl Future<Output = Result<Bytes, LedgerError>>;

    /// Native balance of `account`.
    fn native_balance(&self, account: Address)
    -> impl Future<Output = Result<U256, LedgerError>>;

    /// Sign `call` with `signer` and submit it. Resolves once the node acknowledges the
    /// transaction, not once it is mined.
    fn call<S: KeySigner>(
        &self,
        signer: &S,
        call: &ContractCall,
        params: &TxParams,
    ) -> impl Future<Output = Result<TxHash, LedgerError>>;

    /// Sign and submit a plain native transfer.
    fn transfer<S: KeySigner>(
        &self,
        signer: &S,
        to: Address,
        amount: U256,
        gas: Option<u64>,
    ) -> impl Future<Output = Result<TxHash, LedgerError>>;

    fn receipt(&self, tx_hash: TxHash) -> impl Future<Output = Result<ReceiptStatus, LedgerError>>;

    fn logs(&self, query: &LogQuery) -> impl Future<Output = Result<Vec<LogEntry>, LedgerError>>;
}
