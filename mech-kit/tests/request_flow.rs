mod common;

use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use alloy_core::sol_types::SolCall;
use alloy_primitives::{Address, B256, Bytes, U256};
use common::*;
use mech_core::{
    errors::{Error, LedgerError, PaymentKind, Stage},
    types::{ContentId, DeliveryStatus},
};
use mech_kit::{
    contracts::{IERC20, IMechMarketplace},
    execution::AnyExecution,
    orchestrator::Orchestrator,
    watcher::{WatchOptions, WatchState},
};
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_native_request_attaches_price() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    native_mech(&ledger);
    ledger.set_native_balance(signer.address(), ether(1));
    let orchestrator = direct(ledger, signer.clone());

    let submission = orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap();

    assert_eq!(submission.requests.len(), 1);
    assert_eq!(submission.requests[0].priority_target, MECH);
    assert_eq!(submission.requests[0].prompt_ref, prompt(1));

    let submissions = orchestrator.ledger.submissions();
    assert_eq!(submissions.len(), 1);
    let tx = &submissions[0];
    assert_eq!(tx.tx_hash, submission.tx_hash);
    assert_eq!(tx.sender, signer.address());
    assert_eq!(tx.target, MARKETPLACE);
    assert_eq!(tx.value, U256::from(RATE));
    assert_eq!(tx.selector(), Some(IMechMarketplace::requestCall::SELECTOR));

    let call = IMechMarketplace::requestCall::abi_decode(&tx.effective_data).unwrap();
    assert_eq!(call.requestData.as_ref(), prompt(1).digest().as_slice());
    assert_eq!(call.priorityMech, MECH);
    assert_eq!(
        orchestrator.ledger.native_balance_of(MARKETPLACE),
        U256::from(RATE)
    );
}

#[tokio::test(start_paused = true)]
async fn test_batch_request_prices_every_prompt() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    native_mech(&ledger);
    ledger.set_native_balance(signer.address(), ether(1));
    let orchestrator = direct(ledger, signer);

    let prompts = [prompt(1), prompt(2), prompt(3)];
    let submission = orchestrator
        .submit_request(MECH, &tools(3), &prompts)
        .await
        .unwrap();

    let ids = submission.request_ids();
    assert_eq!(ids.len(), 3);
    assert_ne!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);
    for (request, prompt) in submission.requests.iter().zip(&prompts) {
        assert_eq!(&request.prompt_ref, prompt);
    }

    let tx = &orchestrator.ledger.submissions()[0];
    assert_eq!(
        tx.selector(),
        Some(IMechMarketplace::requestBatchCall::SELECTOR)
    );
    assert_eq!(tx.value, U256::from(RATE * 3));
}

#[tokio::test(start_paused = true)]
async fn test_token_request_approves_then_pays() {
    let signer = PrivateKeySigner::random();
    let payer = signer.address();
    let ledger = ledger();
    token_mech(&ledger);
    ledger.set_token_balance(TOKEN, payer, U256::from(1_000_000u64));
    let orchestrator = direct(ledger, signer);

    orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap();

    let submissions = orchestrator.ledger.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].target, TOKEN);
    assert_eq!(submissions[0].selector(), Some(IERC20::approveCall::SELECTOR));
    assert_eq!(
        submissions[1].selector(),
        Some(IMechMarketplace::requestCall::SELECTOR)
    );
    assert_eq!(submissions[1].value, U256::ZERO);

    let ledger = &orchestrator.ledger;
    assert_eq!(
        ledger.token_balance(TOKEN, payer),
        U256::from(1_000_000u64 - RATE)
    );
    assert_eq!(ledger.token_balance(TOKEN, TRACKER), U256::from(RATE));
    assert_eq!(ledger.allowance(TOKEN, payer, TRACKER), U256::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_token_request_skips_covered_allowance() {
    let signer = PrivateKeySigner::random();
    let payer = signer.address();
    let ledger = ledger();
    token_mech(&ledger);
    ledger.set_token_balance(TOKEN, payer, U256::from(1_000_000u64));
    ledger.set_allowance(TOKEN, payer, TRACKER, U256::MAX);
    let orchestrator = direct(ledger, signer);

    orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap();

    let submissions = orchestrator.ledger.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(
        submissions[0].selector(),
        Some(IMechMarketplace::requestCall::SELECTOR)
    );
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_funds_fail_before_submission() {
    let signer = PrivateKeySigner::random();
    let payer = signer.address();
    let ledger = ledger();
    token_mech(&ledger);
    ledger.set_token_balance(TOKEN, payer, U256::from(RATE - 1));
    let orchestrator = direct(ledger, signer);

    let err = orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap_err();

    match err {
        Error::Funds {
            stage,
            payer: reported,
            required,
            available,
        } => {
            assert_eq!(stage, Stage::Payment(PaymentKind::FungibleToken));
            assert_eq!(reported, payer);
            assert_eq!(required, U256::from(RATE));
            assert_eq!(available, U256::from(RATE - 1));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(orchestrator.ledger.submission_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_native_shortfall_is_a_funds_error() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    native_mech(&ledger);
    let orchestrator = direct(ledger, signer);

    let err = orchestrator
        .submit_request(MECH, &tools(2), &[prompt(1), prompt(2)])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Funds {
            stage: Stage::Payment(PaymentKind::Native),
            ..
        }
    ));
    assert!(err.is_pre_submission());
    assert_eq!(orchestrator.ledger.submission_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_entitlement() {
    let signer = PrivateKeySigner::random();
    let payer = signer.address();
    let token_id = U256::from(7u64);
    let ledger = ledger();
    subscription_mech(&ledger, token_id);
    let orchestrator = direct(ledger, signer);

    let err = orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Funds {
            stage: Stage::Payment(PaymentKind::SubscriptionCheck),
            ..
        }
    ));

    orchestrator
        .ledger
        .set_nft_balance(NFT, token_id, payer, U256::from(5u64));
    orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap();

    let submissions = orchestrator.ledger.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].value, U256::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_prepaid_balance_counts_as_entitlement() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    subscription_mech(&ledger, U256::from(7u64));
    ledger.set_prepaid_balance(TRACKER, signer.address(), U256::from(1u64));
    let orchestrator = direct(ledger, signer);

    orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_submission_failure_is_not_retried() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    native_mech(&ledger);
    ledger.set_native_balance(signer.address(), ether(1));
    ledger.fail_next_submission(LedgerError::transport("connection reset"));
    let orchestrator = direct(ledger, signer);

    let err = orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Submission {
            stage: Stage::Request,
            source: LedgerError::Transport(_),
        }
    ));
    assert_eq!(orchestrator.ledger.submission_attempts(), 1);
    assert!(orchestrator.ledger.submissions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_read_is_retried_once() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    native_mech(&ledger);
    ledger.set_native_balance(signer.address(), ether(1));
    ledger.fail_reads([LedgerError::transport("timeout")]);
    let orchestrator = direct(ledger, signer);

    orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_second_transient_read_failure_surfaces() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    native_mech(&ledger);
    ledger.fail_reads([
        LedgerError::transport("timeout"),
        LedgerError::transport("timeout"),
    ]);
    let orchestrator = direct(ledger, signer);

    let err = orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Read {
            stage: Stage::Request,
            source: LedgerError::Transport(_),
        }
    ));
    assert_eq!(orchestrator.ledger.reads(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_non_transient_read_is_not_retried() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    native_mech(&ledger);
    ledger.fail_reads([LedgerError::Rpc {
        code: -32000,
        message: "execution reverted".into(),
    }]);
    let orchestrator = direct(ledger, signer);

    let err = orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Read { .. }));
    assert_eq!(orchestrator.ledger.reads(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_revert_rolls_back_and_names_request_stage() {
    let signer = PrivateKeySigner::random();
    let payer = signer.address();
    let ledger = ledger();
    native_mech(&ledger);
    ledger.set_native_balance(payer, ether(1));
    ledger.revert_selector(IMechMarketplace::requestCall::SELECTOR, "marketplace paused");
    let orchestrator = direct(ledger, signer);

    let err = orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap_err();

    match err {
        Error::OnchainRevert { stage, reason, .. } => {
            assert_eq!(stage, Stage::Request);
            assert_eq!(reason.as_deref(), Some("marketplace paused"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(orchestrator.ledger.native_balance_of(payer), ether(1));
    assert_eq!(orchestrator.ledger.native_balance_of(MARKETPLACE), U256::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_unmined_request_times_out() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    native_mech(&ledger);
    ledger.set_native_balance(signer.address(), ether(1));
    ledger.delay_receipts(u32::MAX);
    let orchestrator = direct(ledger, signer);

    let err = orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap_err();

    let submitted = orchestrator.ledger.submissions()[0].tx_hash;
    assert!(matches!(
        err,
        Error::Timeout { stage: Stage::Request, tx_hash } if tx_hash == submitted
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_payment_type() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    let tag = B256::repeat_byte(0xee);
    ledger.add_mech_with_tag(MECH, tag, U256::from(RATE));
    let orchestrator = direct(ledger, signer);

    let err = orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::UnknownPaymentModel { mech, tag: reported } if mech == MECH && reported == tag
    ));
}

#[tokio::test(start_paused = true)]
async fn test_receipt_without_request_ids() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    native_mech(&ledger);
    ledger.set_native_balance(signer.address(), ether(1));
    let orchestrator = Orchestrator::builder()
        .ledger(ledger)
        .executor(AnyExecution::new(signer, None, CHAIN_ID))
        .marketplace(Address::repeat_byte(0x77))
        .settings(settings())
        .build();

    let err = orchestrator
        .submit_request(MECH, &tools(1), &[prompt(1)])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::MissingRequestIds {
            expected: 1,
            found: 0,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_rejects_malformed_input() {
    let orchestrator = direct(ledger(), PrivateKeySigner::random());

    let err = orchestrator
        .submit_request(MECH, &[], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let err = orchestrator
        .submit_request(MECH, &tools(2), &[prompt(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert_eq!(orchestrator.ledger.reads(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_waits_for_every_delivery() {
    init_tracing();
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    native_mech(&ledger);
    ledger.set_native_balance(signer.address(), ether(1));
    let result = B256::repeat_byte(0xab);
    ledger.deliver_future_requests(MECH, Bytes::copy_from_slice(result.as_slice()), 2);
    let orchestrator = direct(ledger, signer);

    let outcome = orchestrator
        .run(
            MECH,
            &tools(2),
            &[prompt(1), prompt(2)],
            Duration::from_secs(60),
            WatchOptions::builder()
                .poll_interval(Duration::from_secs(5))
                .build(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.delivery.state, WatchState::Complete);
    assert!(outcome.delivery.is_complete());
    for id in outcome.request_ids() {
        let Some(DeliveryStatus::Delivered(payload)) = outcome.delivery.record.get(&id) else {
            panic!("{id} not delivered");
        };
        assert_eq!(payload.delivery_mech, MECH);
        assert_eq!(payload.content_id, Some(ContentId::from_digest(result)));
        assert_eq!(orchestrator.ledger.request_polls(id), 2);
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_cancelled_before_submission() {
    let signer = PrivateKeySigner::random();
    let ledger = ledger();
    native_mech(&ledger);
    ledger.set_native_balance(signer.address(), ether(1));
    let orchestrator = direct(ledger, signer);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = orchestrator
        .run(
            MECH,
            &tools(1),
            &[prompt(1)],
            Duration::from_secs(60),
            WatchOptions::default(),
            cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Cancelled {
            stage: Stage::Request
        }
    ));
    assert_eq!(orchestrator.ledger.submission_attempts(), 0);
}
