//! Waiting for submitted transactions to be mined.

use std::time::Duration;

use alloy_primitives::TxHash;
use bon::Builder;
use mech_core::{
    errors::{Error, Result, Stage},
    ledger::{ContractCall, LedgerGateway, Receipt, ReceiptStatus, TxParams},
};
use tokio::time::{Instant, sleep};

use crate::{execution::ExecutionStrategy, retry::ReadRetry};

/// How long and how often to poll for a receipt.
#[derive(Builder, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptPolicy {
    #[builder(default = ReceiptPolicy::DEFAULT_POLL_INTERVAL)]
    pub poll_interval: Duration,
    #[builder(default = ReceiptPolicy::DEFAULT_TIMEOUT)]
    pub timeout: Duration,
}

impl ReceiptPolicy {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
}

impl Default for ReceiptPolicy {
    fn default() -> Self {
        ReceiptPolicy {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

/// Settings shared by every step that reads or submits.
#[derive(Builder, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowSettings {
    #[builder(default)]
    pub retry: ReadRetry,
    #[builder(default)]
    pub receipts: ReceiptPolicy,
    #[builder(default)]
    pub tx: TxParams,
}

/// Poll for the receipt of `tx_hash` until it is mined or the policy's timeout passes.
///
/// A reverted transaction becomes [`Error::OnchainRevert`]; running out of time becomes
/// [`Error::Timeout`]. Both carry `stage`.
pub async fn await_receipt<L: LedgerGateway>(
    ledger: &L,
    tx_hash: TxHash,
    stage: Stage,
    settings: &FlowSettings,
) -> Result<Receipt> {
    let policy = settings.receipts;
    let deadline = Instant::now() + policy.timeout;

    loop {
        let status = settings
            .retry
            .run(|| ledger.receipt(tx_hash))
            .await
            .map_err(|source| Error::read(stage, source))?;

        match status {
            ReceiptStatus::Success(receipt) => return Ok(receipt),
            ReceiptStatus::Reverted { reason } => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%tx_hash, ?reason, "Transaction reverted during {stage}");
                return Err(Error::OnchainRevert {
                    stage,
                    tx_hash,
                    reason,
                });
            }
            ReceiptStatus::Pending => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout { stage, tx_hash });
        }
        sleep(policy.poll_interval.min(deadline - now)).await;
    }
}

/// Submit `call` through `executor` and wait for it to be mined.
///
/// The submission itself is attempted exactly once.
pub async fn submit_and_confirm<L, E>(
    ledger: &L,
    executor: &E,
    call: ContractCall,
    stage: Stage,
    settings: &FlowSettings,
) -> Result<Receipt>
where
    L: LedgerGateway,
    E: ExecutionStrategy,
{
    let tx_hash = executor
        .execute_call(ledger, call, &settings.tx)
        .await
        .map_err(|source| Error::submission(stage, source))?;

    #[cfg(feature = "tracing")]
    tracing::debug!(%tx_hash, "Submitted transaction for {stage}");

    await_receipt(ledger, tx_hash, stage, settings).await
}
