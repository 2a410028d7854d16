//! Execution strategies: who signs a transaction and whose funds it moves.
//!
//! With [`DirectKey`] the signer's own account sends and pays. With [`DelegatedSafe`] the
//! signer is an owner of a Safe proxy wallet; every call is wrapped in `execTransaction` and
//! the proxy is the on-chain sender, so balances and allowances are checked against the
//! proxy. [`ExecutionContext::sender`] is the single answer to "whose funds?".

mod direct;
mod safe;

use alloy_primitives::{Address, TxHash, U256};
use mech_core::{
    errors::LedgerError,
    ledger::{ContractCall, KeySigner, LedgerGateway, TxParams},
};

pub use direct::DirectKey;
pub use safe::{DelegatedSafe, safe_domain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    Direct,
    Delegated,
}

/// Addresses involved in executing a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    pub mode: ExecutionMode,
    /// Address of the signing key.
    pub signer: Address,
    /// Proxy wallet acting on the signer's behalf, in delegated mode.
    pub proxy: Option<Address>,
}

impl ExecutionContext {
    pub fn direct(signer: Address) -> Self {
        ExecutionContext {
            mode: ExecutionMode::Direct,
            signer,
            proxy: None,
        }
    }

    pub fn delegated(signer: Address, proxy: Address) -> Self {
        ExecutionContext {
            mode: ExecutionMode::Delegated,
            signer,
            proxy: Some(proxy),
        }
    }

    /// The address that appears as sender of the effective call, and whose balances and
    /// allowances pay for it.
    pub fn sender(&self) -> Address {
        match (self.mode, self.proxy) {
            (ExecutionMode::Delegated, Some(proxy)) => proxy,
            _ => self.signer,
        }
    }
}

/// Submits calls and transfers on behalf of [`ExecutionStrategy::context`]'s sender.
///
/// Both operations resolve once the ledger acknowledges the transaction; they never wait
/// for it to be mined and never retry.
pub trait ExecutionStrategy {
    fn context(&self) -> &ExecutionContext;

    fn execute_call<L: LedgerGateway>(
        &self,
        ledger: &L,
        call: ContractCall,
        params: &TxParams,
    ) -> impl Future<Output = Result<TxHash, LedgerError>>;

    fn execute_transfer<L: LedgerGateway>(
        &self,
        ledger: &L,
        to: Address,
        amount: U256,
        gas: Option<u64>,
    ) -> impl Future<Output = Result<TxHash, LedgerError>>;
}

/// Either execution strategy, picked at runtime (typically from configuration).
#[derive(Debug, Clone)]
pub enum AnyExecution<S> {
    Direct(DirectKey<S>),
    Delegated(DelegatedSafe<S>),
}

impl<S: KeySigner> AnyExecution<S> {
    /// Direct execution when `safe` is `None`, delegated execution through `safe` otherwise.
    pub fn new(signer: S, safe: Option<Address>, chain_id: u64) -> Self {
        match safe {
            Some(safe) => AnyExecution::Delegated(DelegatedSafe::new(signer, safe, chain_id)),
            None => AnyExecution::Direct(DirectKey::new(signer)),
        }
    }
}

impl<S: KeySigner> ExecutionStrategy for AnyExecution<S> {
    fn context(&self) -> &ExecutionContext {
        match self {
            AnyExecution::Direct(direct) => direct.context(),
            AnyExecution::Delegated(safe) => safe.context(),
        }
    }

    async fn execute_call<L: LedgerGateway>(
        &self,
        ledger: &L,
        call: ContractCall,
        params: &TxParams,
    ) -> Result<TxHash, LedgerError> {
        match self {
            AnyExecution::Direct(direct) => direct.execute_call(ledger, call, params).await,
            AnyExecution::Delegated(safe) => safe.execute_call(ledger, call, params).await,
        }
    }

    async fn execute_transfer<L: LedgerGateway>(
        &self,
        ledger: &L,
        to: Address,
        amount: U256,
        gas: Option<u64>,
    ) -> Result<TxHash, LedgerError> {
        match self {
            AnyExecution::Direct(direct) => direct.execute_transfer(ledger, to, amount, gas).await,
            AnyExecution::Delegated(safe) => safe.execute_transfer(ledger, to, amount, gas).await,
        }
    }
}
