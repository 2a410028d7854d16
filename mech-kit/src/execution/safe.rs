use std::sync::Arc;

use alloy_core::sol_types::{Eip712Domain, SolCall, SolStruct, eip712_domain};
use alloy_primitives::{Address, B256, Bytes, TxHash, U256};
use mech_core::{
    errors::LedgerError,
    ledger::{ContractCall, KeySigner, LedgerGateway, ReceiptStatus, TxParams},
};
use tokio::sync::Mutex;

use crate::{
    contracts::{ISafe, SafeTx, read_call},
    execution::{ExecutionContext, ExecutionStrategy},
    retry::ReadRetry,
};

/// `CALL`, as opposed to `DELEGATECALL`.
const OPERATION_CALL: u8 = 0;

/// EIP-712 domain of a Safe proxy wallet.
pub fn safe_domain(chain_id: u64, safe: Address) -> Eip712Domain {
    eip712_domain! {
        chain_id: chain_id,
        verifying_contract: safe,
    }
}

/// A Safe proxy wallet executes every call; the signer is one of its owners.
///
/// Each call is wrapped in a `SafeTx` at the proxy's current nonce, signed under the
/// proxy's EIP-712 domain and submitted as `execTransaction` from the owner's account.
/// Assumes a threshold of one.
///
/// Executions through one executor (and its clones) are serialized: the proxy lock is held
/// from the nonce read until the ledger acknowledges the transaction. While the previous
/// execution is still unmined, the next one is signed for the nonce after it.
#[derive(Debug, Clone)]
pub struct DelegatedSafe<S> {
    signer: S,
    chain_id: u64,
    context: ExecutionContext,
    retry: ReadRetry,
    last_submitted: Arc<Mutex<Option<Submitted>>>,
}

/// The most recent execution acknowledged by the ledger.
#[derive(Debug, Clone, Copy)]
struct Submitted {
    nonce: U256,
    tx_hash: TxHash,
}

impl<S: KeySigner> DelegatedSafe<S> {
    pub fn new(signer: S, safe: Address, chain_id: u64) -> Self {
        let context = ExecutionContext::delegated(signer.address(), safe);
        DelegatedSafe {
            signer,
            chain_id,
            context,
            retry: ReadRetry::default(),
            last_submitted: Arc::default(),
        }
    }

    pub fn with_retry(mut self, retry: ReadRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn safe(&self) -> Address {
        self.context.sender()
    }

    /// Digest the owner signs for `tx`.
    pub fn safe_tx_hash(&self, tx: &SafeTx) -> B256 {
        tx.eip712_signing_hash(&safe_domain(self.chain_id, self.safe()))
    }

    /// Wrap an inner call into an `execTransaction` call on the proxy, signed for `nonce`.
    pub async fn wrap(
        &self,
        nonce: U256,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> Result<ContractCall, LedgerError> {
        let safe_tx = SafeTx {
            to,
            value,
            data: data.clone(),
            operation: OPERATION_CALL,
            safeTxGas: U256::ZERO,
            baseGas: U256::ZERO,
            gasPrice: U256::ZERO,
            gasToken: Address::ZERO,
            refundReceiver: Address::ZERO,
            nonce,
        };
        let hash = self.safe_tx_hash(&safe_tx);
        let signature = self
            .signer
            .sign_hash(&hash)
            .await
            .map_err(|e| LedgerError::signing(e.to_string()))?;

        let exec = ISafe::execTransactionCall {
            to,
            value,
            data,
            operation: OPERATION_CALL,
            safeTxGas: U256::ZERO,
            baseGas: U256::ZERO,
            gasPrice: U256::ZERO,
            gasToken: Address::ZERO,
            refundReceiver: Address::ZERO,
            signatures: Bytes::from(signature.as_bytes().to_vec()),
        };
        Ok(ContractCall::new(self.safe(), exec.abi_encode()))
    }

    /// Read the proxy nonce, wrap and submit, all under the proxy lock.
    ///
    /// Fails without submitting anything if the nonce cannot be read or the signer
    /// refuses.
    async fn submit<L: LedgerGateway>(
        &self,
        ledger: &L,
        to: Address,
        value: U256,
        data: Bytes,
        params: &TxParams,
    ) -> Result<TxHash, LedgerError> {
        let safe = self.safe();
        let mut last_submitted = self.last_submitted.lock().await;

        let onchain = read_call(ledger, &self.retry, safe, &ISafe::nonceCall {}).await?;
        let nonce = match *last_submitted {
            // The proxy has not moved past the previous execution: it is either unmined or
            // reverted, which left the nonce unused.
            Some(prev) if prev.nonce >= onchain => match ledger.receipt(prev.tx_hash).await? {
                ReceiptStatus::Pending => prev.nonce + U256::from(1),
                _ => onchain,
            },
            _ => onchain,
        };
        let wrapped = self.wrap(nonce, to, value, data).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(%safe, %nonce, %to, "Signed proxy transaction");

        let tx_hash = ledger.call(&self.signer, &wrapped, params).await?;
        *last_submitted = Some(Submitted { nonce, tx_hash });
        Ok(tx_hash)
    }
}

impl<S: KeySigner> ExecutionStrategy for DelegatedSafe<S> {
    fn context(&self) -> &ExecutionContext {
        &self.context
    }

    async fn execute_call<L: LedgerGateway>(
        &self,
        ledger: &L,
        call: ContractCall,
        params: &TxParams,
    ) -> Result<TxHash, LedgerError> {
        self.submit(ledger, call.to, call.value, call.data, params).await
    }

    async fn execute_transfer<L: LedgerGateway>(
        &self,
        ledger: &L,
        to: Address,
        amount: U256,
        gas: Option<u64>,
    ) -> Result<TxHash, LedgerError> {
        let params = TxParams {
            gas_limit: gas,
            gas_price: None,
        };
        self.submit(ledger, to, amount, Bytes::new(), &params).await
    }
}

#[cfg(test)]
mod tests {
    use alloy::signers::local::PrivateKeySigner;
    use alloy_primitives::address;

    use super::*;

    #[tokio::test]
    async fn test_safe_tx_hash_depends_on_domain() {
        let signer = PrivateKeySigner::random();
        let safe = address!("0x1111111111111111111111111111111111111111");
        let gnosis = DelegatedSafe::new(signer.clone(), safe, 100);
        let base = DelegatedSafe::new(signer, safe, 8453);

        let tx = SafeTx {
            to: Address::repeat_byte(0x22),
            value: U256::from(5u64),
            data: Bytes::new(),
            operation: OPERATION_CALL,
            safeTxGas: U256::ZERO,
            baseGas: U256::ZERO,
            gasPrice: U256::ZERO,
            gasToken: Address::ZERO,
            refundReceiver: Address::ZERO,
            nonce: U256::ZERO,
        };

        assert_ne!(gnosis.safe_tx_hash(&tx), base.safe_tx_hash(&tx));
        assert_eq!(gnosis.safe(), safe);
        assert_eq!(gnosis.context().sender(), safe);
    }
}
