use alloy_primitives::{Address, TxHash, U256};
use mech_core::{
    errors::LedgerError,
    ledger::{ContractCall, KeySigner, LedgerGateway, TxParams},
};

use crate::execution::{ExecutionContext, ExecutionStrategy};

/// The signer's own account sends every transaction.
#[derive(Debug, Clone)]
pub struct DirectKey<S> {
    signer: S,
    context: ExecutionContext,
}

impl<S: KeySigner> DirectKey<S> {
    pub fn new(signer: S) -> Self {
        let context = ExecutionContext::direct(signer.address());
        DirectKey { signer, context }
    }

    pub fn signer(&self) -> &S {
        &self.signer
    }
}

impl<S: KeySigner> ExecutionStrategy for DirectKey<S> {
    fn context(&self) -> &ExecutionContext {
        &self.context
    }

    async fn execute_call<L: LedgerGateway>(
        &self,
        ledger: &L,
        call: ContractCall,
        params: &TxParams,
    ) -> Result<TxHash, LedgerError> {
        ledger.call(&self.signer, &call, params).await
    }

    async fn execute_transfer<L: LedgerGateway>(
        &self,
        ledger: &L,
        to: Address,
        amount: U256,
        gas: Option<u64>,
    ) -> Result<TxHash, LedgerError> {
        ledger.transfer(&self.signer, to, amount, gas).await
    }
}
