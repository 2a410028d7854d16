#![allow(dead_code)]

use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use alloy_primitives::{Address, B256, U256, address};
use mech_core::{
    descriptor::PlanDescriptor,
    types::{ContentId, Did, PaymentModel, TokenAmount},
};
pub use mech_core::ledger::KeySigner;
use mech_kit::{
    execution::AnyExecution,
    mock::MockLedger,
    orchestrator::Orchestrator,
    receipt::{FlowSettings, ReceiptPolicy},
    retry::ReadRetry,
    subscription::SubscriptionContracts,
};

pub const CHAIN_ID: u64 = 100;
pub const MARKETPLACE: Address = address!("0x735FAAb1c4Ec41128c367AFb5c3baC73509f70bB");
pub const MECH: Address = address!("0x601024E27f1C67B28209E24272CED8A31fc8151F");
pub const SAFE: Address = address!("0x5afe5afe5afe5afe5afe5afe5afe5afe5afe5afe");
pub const TOKEN: Address = address!("0x2222222222222222222222222222222222222222");
pub const TRACKER: Address = address!("0x3333333333333333333333333333333333333333");
pub const NFT: Address = address!("0x1111111111111111111111111111111111111111");
pub const PLAN_OWNER: Address = address!("0x3CB9B3bBfde8501f411bB69Ad3DC07908ED0dE20");
pub const FEE_RECEIVER: Address = address!("0x4444444444444444444444444444444444444444");

pub const RATE: u64 = 10_000;

/// Route the crate's `tracing` output through the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn ether(n: u64) -> U256 {
    U256::from(n) * U256::from(10u64).pow(U256::from(18u64))
}

pub fn ledger() -> MockLedger {
    MockLedger::new(CHAIN_ID, MARKETPLACE)
}

pub fn settings() -> FlowSettings {
    FlowSettings::builder()
        .retry(ReadRetry::new(Duration::from_millis(100)))
        .receipts(
            ReceiptPolicy::builder()
                .poll_interval(Duration::from_secs(1))
                .timeout(Duration::from_secs(30))
                .build(),
        )
        .build()
}

pub fn direct(
    ledger: MockLedger,
    signer: PrivateKeySigner,
) -> Orchestrator<MockLedger, AnyExecution<PrivateKeySigner>> {
    Orchestrator::builder()
        .ledger(ledger)
        .executor(AnyExecution::new(signer, None, CHAIN_ID))
        .marketplace(MARKETPLACE)
        .settings(settings())
        .build()
}

pub fn delegated(
    ledger: MockLedger,
    signer: PrivateKeySigner,
) -> Orchestrator<MockLedger, AnyExecution<PrivateKeySigner>> {
    Orchestrator::builder()
        .ledger(ledger)
        .executor(AnyExecution::new(signer, Some(SAFE), CHAIN_ID))
        .marketplace(MARKETPLACE)
        .settings(settings())
        .build()
}

pub fn native_mech(ledger: &MockLedger) {
    ledger.add_mech(MECH, PaymentModel::Native, U256::from(RATE));
}

pub fn token_mech(ledger: &MockLedger) {
    ledger.add_mech(MECH, PaymentModel::FungibleToken, U256::from(RATE));
    ledger.add_token_tracker(PaymentModel::FungibleToken, TRACKER, TOKEN);
}

pub fn subscription_mech(ledger: &MockLedger, token_id: U256) {
    ledger.add_mech(MECH, PaymentModel::SubscriptionNative, U256::from(RATE));
    ledger.add_subscription_tracker(PaymentModel::SubscriptionNative, TRACKER, NFT, token_id);
}

pub fn prompt(n: u8) -> ContentId {
    ContentId::from_digest(B256::repeat_byte(n))
}

pub fn tools(n: usize) -> Vec<String> {
    vec!["prediction-online".to_string(); n]
}

pub fn subscription_contracts() -> SubscriptionContracts {
    SubscriptionContracts::builder()
        .sales_template(address!("0xa0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0"))
        .lock_payment_condition(address!("0xa1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1"))
        .transfer_nft_condition(address!("0xa2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2"))
        .escrow_payment_condition(address!("0xa3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3"))
        .subscription_provider(address!("0xa4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4"))
        .build()
}

/// A plan paying 990000 to the owner and 10000 to the fee receiver, in `token`.
pub fn plan(token: Address) -> PlanDescriptor {
    PlanDescriptor {
        did: Did(B256::repeat_byte(0x0b)),
        owner: PLAN_OWNER,
        nft_contract: NFT,
        nft_amount: TokenAmount::from(100u64),
        token_address: token,
        amounts: vec![TokenAmount::from(990_000u64), TokenAmount::from(10_000u64)],
        receivers: vec![PLAN_OWNER, FEE_RECEIVER],
        transfer: false,
        expiration_block: 0,
    }
}
