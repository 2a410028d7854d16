//! Payment strategies: checking that the payer can cover a request and granting the
//! allowances the ledger needs to pull payment.
//!
//! The payer is always the execution context's sender. In delegated mode that is the proxy
//! wallet, never the signing key.

use alloy_core::sol_types::SolCall;
use alloy_primitives::{Address, TxHash, U256};
use mech_core::{
    errors::{Error, PaymentKind, Result, Stage},
    ledger::{ContractCall, LedgerGateway},
    types::PaymentModel,
};

use crate::{
    contracts::{IBalanceTracker, IERC20, IERC1155, IMechMarketplace, read_call},
    execution::ExecutionStrategy,
    receipt::{FlowSettings, submit_and_confirm},
};

/// How a request is paid for, with the addresses needed to check and settle payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStrategy {
    /// Native asset attached to the request transaction.
    Native,
    /// ERC-20 `token`, pulled by `spender` after approval.
    FungibleToken { token: Address, spender: Address },
    /// Entitlement held as a subscription NFT or as prepaid balance in the tracker.
    SubscriptionCheck {
        balance_tracker: Address,
        nft: Address,
        token_id: U256,
    },
}

impl PaymentStrategy {
    pub fn kind(&self) -> PaymentKind {
        match self {
            PaymentStrategy::Native => PaymentKind::Native,
            PaymentStrategy::FungibleToken { .. } => PaymentKind::FungibleToken,
            PaymentStrategy::SubscriptionCheck { .. } => PaymentKind::SubscriptionCheck,
        }
    }

    fn stage(&self) -> Stage {
        Stage::Payment(self.kind())
    }

    fn covers(&self, available: U256, amount: U256) -> bool {
        match self {
            PaymentStrategy::SubscriptionCheck { .. } => !available.is_zero(),
            _ => available >= amount,
        }
    }

    /// Look up the balance tracker the marketplace uses for `model` and build the strategy
    /// that checks against it.
    pub async fn resolve<L: LedgerGateway>(
        ledger: &L,
        settings: &FlowSettings,
        marketplace: Address,
        model: PaymentModel,
    ) -> Result<Self> {
        if model == PaymentModel::Native {
            return Ok(PaymentStrategy::Native);
        }

        let retry = &settings.retry;
        let lookup = IMechMarketplace::mapPaymentTypeBalanceTrackersCall {
            paymentType: model.tag(),
        };
        let kind = if model.is_subscription() {
            PaymentKind::SubscriptionCheck
        } else {
            PaymentKind::FungibleToken
        };
        let stage = Stage::Payment(kind);
        let read_err = |source| Error::read(stage, source);

        let tracker = read_call(ledger, retry, marketplace, &lookup)
            .await
            .map_err(read_err)?;

        let strategy = if model.is_subscription() {
            let nft = read_call(ledger, retry, tracker, &IBalanceTracker::subscriptionNFTCall {})
                .await
                .map_err(read_err)?;
            let token_id = read_call(
                ledger,
                retry,
                tracker,
                &IBalanceTracker::subscriptionTokenIdCall {},
            )
            .await
            .map_err(read_err)?;
            PaymentStrategy::SubscriptionCheck {
                balance_tracker: tracker,
                nft,
                token_id,
            }
        } else {
            let token = read_call(ledger, retry, tracker, &IBalanceTracker::tokenCall {})
                .await
                .map_err(read_err)?;
            PaymentStrategy::FungibleToken {
                token,
                spender: tracker,
            }
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(%model, ?strategy, "Resolved payment strategy");

        Ok(strategy)
    }

    /// What `payer` currently holds towards this payment.
    ///
    /// For subscriptions this is the NFT credit balance plus the prepaid tracker balance.
    pub async fn available<L: LedgerGateway>(
        &self,
        ledger: &L,
        settings: &FlowSettings,
        payer: Address,
    ) -> Result<U256> {
        let retry = &settings.retry;
        let stage = self.stage();
        let read_err = |source| Error::read(stage, source);

        match *self {
            PaymentStrategy::Native => settings
                .retry
                .run(|| ledger.native_balance(payer))
                .await
                .map_err(read_err),
            PaymentStrategy::FungibleToken { token, .. } => read_call(
                ledger,
                retry,
                token,
                &IERC20::balanceOfCall { account: payer },
            )
            .await
            .map_err(read_err),
            PaymentStrategy::SubscriptionCheck {
                balance_tracker,
                nft,
                token_id,
            } => {
                let credits = read_call(
                    ledger,
                    retry,
                    nft,
                    &IERC1155::balanceOfCall {
                        account: payer,
                        id: token_id,
                    },
                )
                .await
                .map_err(read_err)?;
                let prepaid = read_call(
                    ledger,
                    retry,
                    balance_tracker,
                    &IBalanceTracker::mapRequesterBalancesCall { requester: payer },
                )
                .await
                .map_err(read_err)?;
                Ok(credits.saturating_add(prepaid))
            }
        }
    }

    /// Whether `payer` can cover `amount`.
    ///
    /// Subscriptions only need some entitlement: any NFT credit or any prepaid balance.
    pub async fn check_balance<L: LedgerGateway>(
        &self,
        ledger: &L,
        settings: &FlowSettings,
        payer: Address,
        amount: U256,
    ) -> Result<bool> {
        let available = self.available(ledger, settings, payer).await?;
        Ok(self.covers(available, amount))
    }

    /// Like [`check_balance`](Self::check_balance), but a shortfall is an [`Error::Funds`].
    pub async fn ensure_funds<L: LedgerGateway>(
        &self,
        ledger: &L,
        settings: &FlowSettings,
        payer: Address,
        amount: U256,
    ) -> Result<()> {
        let available = self.available(ledger, settings, payer).await?;
        if self.covers(available, amount) {
            return Ok(());
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(%payer, %amount, %available, "Insufficient funds for {}", self.kind());

        Err(Error::Funds {
            stage: self.stage(),
            payer,
            required: amount,
            available,
        })
    }

    /// Approve the strategy's spender for `amount` unless the current allowance already
    /// covers it.
    ///
    /// The owner of the allowance is the executor's sender. Returns the approval
    /// transaction hash once it is mined, or `None` when nothing had to be submitted.
    pub async fn approve_if_needed<L, E>(
        &self,
        ledger: &L,
        executor: &E,
        amount: U256,
        settings: &FlowSettings,
    ) -> Result<Option<TxHash>>
    where
        L: LedgerGateway,
        E: ExecutionStrategy,
    {
        let PaymentStrategy::FungibleToken { token, spender } = *self else {
            return Ok(None);
        };
        let stage = self.stage();
        let owner = executor.context().sender();

        let allowance = read_call(
            ledger,
            &settings.retry,
            token,
            &IERC20::allowanceCall { owner, spender },
        )
        .await
        .map_err(|source| Error::read(stage, source))?;

        if allowance >= amount {
            #[cfg(feature = "tracing")]
            tracing::debug!(%owner, %spender, %allowance, "Allowance already sufficient");
            return Ok(None);
        }

        let approve = IERC20::approveCall { spender, amount };
        let call = ContractCall::new(token, approve.abi_encode());
        let receipt = submit_and_confirm(ledger, executor, call, stage, settings).await?;

        #[cfg(feature = "tracing")]
        tracing::info!(%owner, %spender, %amount, tx_hash = %receipt.tx_hash, "Approved token spend");

        Ok(Some(receipt.tx_hash))
    }
}
