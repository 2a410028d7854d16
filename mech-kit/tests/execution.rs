mod common;

use alloy::signers::local::PrivateKeySigner;
use alloy_core::sol_types::{SolCall, SolValue};
use alloy_primitives::{Address, Bytes, TxHash, U256};
use common::*;
use mech_core::{
    errors::{Error, LedgerError, Stage},
    ledger::{
        ContractCall, KeySigner, LedgerGateway, LogEntry, LogQuery, ReceiptStatus, TxParams,
    },
};
use mech_kit::{
    contracts::ISafe,
    execution::{AnyExecution, DelegatedSafe, DirectKey, ExecutionMode, ExecutionStrategy},
    mock::MockLedger,
};
use tokio::task::yield_now;

const RECIPIENT: Address = Address::repeat_byte(0x42);

#[tokio::test]
async fn test_direct_transfer_moves_signer_funds() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    ledger.set_native_balance(signer.address(), ether(2));
    let executor = DirectKey::new(signer.clone());

    executor
        .execute_transfer(&ledger, RECIPIENT, ether(1), None)
        .await
        .unwrap();

    assert_eq!(ledger.native_balance_of(signer.address()), ether(1));
    assert_eq!(ledger.native_balance_of(RECIPIENT), ether(1));
    let tx = &ledger.submissions()[0];
    assert_eq!(tx.signer, signer.address());
    assert_eq!(tx.sender, signer.address());
}

#[tokio::test]
async fn test_delegated_transfer_moves_proxy_funds() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    ledger.add_safe(SAFE, signer.address());
    ledger.set_native_balance(SAFE, ether(2));
    let executor = DelegatedSafe::new(signer.clone(), SAFE, CHAIN_ID);
    assert_eq!(executor.context().mode, ExecutionMode::Delegated);

    executor
        .execute_transfer(&ledger, RECIPIENT, ether(1), Some(100_000))
        .await
        .unwrap();

    assert_eq!(ledger.native_balance_of(SAFE), ether(1));
    assert_eq!(ledger.native_balance_of(RECIPIENT), ether(1));
    let tx = &ledger.submissions()[0];
    assert_eq!(tx.signer, signer.address());
    assert_eq!(tx.to, SAFE);
    assert_eq!(tx.value, U256::ZERO);
    assert_eq!(tx.sender, SAFE);
    assert_eq!(tx.target, RECIPIENT);
    assert_eq!(tx.effective_value, ether(1));
}

#[tokio::test]
async fn test_wrapped_call_is_signed_for_the_current_nonce() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    ledger.add_safe(SAFE, signer.address());
    let executor = DelegatedSafe::new(signer, SAFE, CHAIN_ID);
    let inner = ContractCall::new(RECIPIENT, vec![0xde, 0xad, 0xbe, 0xef]);

    for expected_nonce in 1..=2u64 {
        executor
            .execute_call(&ledger, inner.clone(), &TxParams::default())
            .await
            .unwrap();
        assert_eq!(ledger.safe_nonce(SAFE), Some(U256::from(expected_nonce)));
    }

    let submissions = ledger.submissions();
    assert!(submissions.iter().all(|tx| !tx.reverted));
    let exec = ISafe::execTransactionCall::abi_decode(&submissions[1].data).unwrap();
    assert_eq!(exec.to, RECIPIENT);
    assert_eq!(exec.data, inner.data);
    assert_eq!(exec.signatures.len(), 65);
}

#[tokio::test(start_paused = true)]
async fn test_signature_from_a_non_owner_reverts() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    native_mech(&ledger);
    ledger.add_safe(SAFE, Address::repeat_byte(0x01));
    ledger.set_native_balance(SAFE, ether(1));
    let orchestrator = delegated(ledger, signer);

    let err = orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap_err();

    match err {
        Error::OnchainRevert { stage, reason, .. } => {
            assert_eq!(stage, Stage::Request);
            assert!(reason.unwrap().starts_with("GS026"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(orchestrator.ledger.safe_nonce(SAFE), Some(U256::ZERO));
}

#[tokio::test(start_paused = true)]
async fn test_delegated_request_is_paid_by_the_proxy() {
    let signer = PrivateKeySigner::random();
    let owner = signer.address();
    let ledger = ledger();
    native_mech(&ledger);
    ledger.add_safe(SAFE, owner);
    ledger.set_native_balance(SAFE, ether(1));
    let orchestrator = delegated(ledger, signer);
    assert_eq!(orchestrator.context().sender(), SAFE);

    orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap();

    let ledger = &orchestrator.ledger;
    let tx = &ledger.submissions()[0];
    assert_eq!(tx.signer, owner);
    assert_eq!(tx.sender, SAFE);
    assert_eq!(tx.target, MARKETPLACE);
    assert_eq!(tx.effective_value, U256::from(RATE));
    assert_eq!(ledger.native_balance_of(SAFE), ether(1) - U256::from(RATE));
    assert_eq!(ledger.native_balance_of(owner), U256::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_delegated_funds_are_checked_on_the_proxy() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    native_mech(&ledger);
    ledger.add_safe(SAFE, signer.address());
    ledger.set_native_balance(signer.address(), ether(1));
    let orchestrator = delegated(ledger, signer);

    let err = orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Funds { payer, .. } if payer == SAFE));
    assert_eq!(orchestrator.ledger.submission_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delegated_token_allowance_belongs_to_the_proxy() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    token_mech(&ledger);
    ledger.add_safe(SAFE, signer.address());
    ledger.set_token_balance(TOKEN, SAFE, U256::from(RATE));
    let orchestrator = delegated(ledger, signer);

    orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap();

    let ledger = &orchestrator.ledger;
    assert_eq!(ledger.submissions().len(), 2);
    assert!(ledger.submissions().iter().all(|tx| tx.sender == SAFE));
    assert_eq!(ledger.token_balance(TOKEN, SAFE), U256::ZERO);
    assert_eq!(ledger.token_balance(TOKEN, TRACKER), U256::from(RATE));
}

#[tokio::test]
async fn test_unreadable_nonce_submits_nothing() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    ledger.add_safe(SAFE, signer.address());
    ledger.fail_reads([LedgerError::decode("garbage")]);
    let executor = AnyExecution::new(signer, Some(SAFE), CHAIN_ID);

    let err = executor
        .execute_call(&ledger, ContractCall::new(RECIPIENT, vec![0x01]), &TxParams::default())
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Decode(_)));
    assert_eq!(ledger.submission_attempts(), 0);
}

/// The mock behind a node that yields before answering, so concurrent executions
/// interleave. With `pinned_safe_nonce` set it also keeps reporting that proxy nonce and
/// pending receipts, as a node does while transactions are unmined.
struct SlowNode<'a> {
    inner: &'a MockLedger,
    pinned_safe_nonce: Option<U256>,
}

impl<'a> SlowNode<'a> {
    fn new(inner: &'a MockLedger) -> Self {
        SlowNode {
            inner,
            pinned_safe_nonce: None,
        }
    }

    fn unmined(inner: &'a MockLedger, safe_nonce: U256) -> Self {
        SlowNode {
            inner,
            pinned_safe_nonce: Some(safe_nonce),
        }
    }
}

impl LedgerGateway for SlowNode<'_> {
    async fn read(&self, call: &ContractCall) -> Result<Bytes, LedgerError> {
        yield_now().await;
        if let Some(nonce) = self.pinned_safe_nonce
            && call.to == SAFE
            && call.selector() == Some(ISafe::nonceCall::SELECTOR)
        {
            return Ok(Bytes::from(nonce.abi_encode()));
        }
        self.inner.read(call).await
    }

    async fn native_balance(&self, account: Address) -> Result<U256, LedgerError> {
        yield_now().await;
        self.inner.native_balance(account).await
    }

    async fn call<S: KeySigner>(
        &self,
        signer: &S,
        call: &ContractCall,
        params: &TxParams,
    ) -> Result<TxHash, LedgerError> {
        yield_now().await;
        self.inner.call(signer, call, params).await
    }

    async fn transfer<S: KeySigner>(
        &self,
        signer: &S,
        to: Address,
        amount: U256,
        gas: Option<u64>,
    ) -> Result<TxHash, LedgerError> {
        yield_now().await;
        self.inner.transfer(signer, to, amount, gas).await
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<ReceiptStatus, LedgerError> {
        yield_now().await;
        if self.pinned_safe_nonce.is_some() {
            return Ok(ReceiptStatus::Pending);
        }
        self.inner.receipt(tx_hash).await
    }

    async fn logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, LedgerError> {
        yield_now().await;
        self.inner.logs(query).await
    }
}

#[tokio::test]
async fn test_concurrent_executions_take_consecutive_nonces() {
    let signer = PrivateKeySigner::random();
    let mock = ledger();
    mock.add_safe(SAFE, signer.address());
    let node = SlowNode::new(&mock);
    let executor = DelegatedSafe::new(signer, SAFE, CHAIN_ID);
    let other = executor.clone();
    let params = TxParams::default();

    let (first, second) = tokio::join!(
        executor.execute_call(&node, ContractCall::new(RECIPIENT, vec![0x01]), &params),
        other.execute_call(&node, ContractCall::new(RECIPIENT, vec![0x02]), &params),
    );
    first.unwrap();
    second.unwrap();

    let submissions = mock.submissions();
    assert_eq!(submissions.len(), 2);
    assert!(submissions.iter().all(|tx| !tx.reverted));
    assert_eq!(mock.safe_nonce(SAFE), Some(U256::from(2u64)));
}

#[tokio::test]
async fn test_unmined_execution_is_followed_at_the_next_nonce() {
    let signer = PrivateKeySigner::random();
    let mock = ledger();
    mock.add_safe(SAFE, signer.address());
    let node = SlowNode::unmined(&mock, U256::ZERO);
    let executor = DelegatedSafe::new(signer, SAFE, CHAIN_ID);

    for data in [0x01u8, 0x02] {
        executor
            .execute_call(&node, ContractCall::new(RECIPIENT, vec![data]), &TxParams::default())
            .await
            .unwrap();
    }

    assert!(mock.submissions().iter().all(|tx| !tx.reverted));
    assert_eq!(mock.safe_nonce(SAFE), Some(U256::from(2u64)));
}

#[tokio::test]
async fn test_reverted_execution_frees_its_nonce() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    ledger.add_safe(SAFE, signer.address());
    ledger.revert_selector([0xde, 0xad, 0xbe, 0xef], "paused");
    let executor = DelegatedSafe::new(signer, SAFE, CHAIN_ID);

    executor
        .execute_call(
            &ledger,
            ContractCall::new(RECIPIENT, vec![0xde, 0xad, 0xbe, 0xef]),
            &TxParams::default(),
        )
        .await
        .unwrap();
    assert_eq!(ledger.safe_nonce(SAFE), Some(U256::ZERO));

    executor
        .execute_call(&ledger, ContractCall::new(RECIPIENT, vec![0x01]), &TxParams::default())
        .await
        .unwrap();

    let submissions = ledger.submissions();
    assert!(submissions[0].reverted);
    assert!(!submissions[1].reverted);
    assert_eq!(ledger.safe_nonce(SAFE), Some(U256::from(1u64)));
}
