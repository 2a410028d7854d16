//! Orchestrator: one entry point for paying for requests, submitting them, awaiting their
//! deliveries and purchasing subscriptions.
//!
//! # Example
//!
//! ```no_run
//! use alloy::signers::local::PrivateKeySigner;
//! use mech_core::types::ContentId;
//! use mech_kit::{
//!     config::{self, ConfigSource, chains::Gnosis},
//!     execution::AnyExecution,
//!     orchestrator::Orchestrator,
//!     rpc::JsonRpcLedger,
//!     watcher::WatchOptions,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = config::resolve([
//!     ConfigSource::preset::<Gnosis>(),
//!     ConfigSource::environment(),
//! ])?;
//! let signer = PrivateKeySigner::random();
//! let ledger = JsonRpcLedger::new(config.rpc_url.clone(), config.chain_id);
//! let orchestrator = Orchestrator::builder()
//!     .ledger(ledger)
//!     .executor(AnyExecution::new(signer, config.safe, config.chain_id))
//!     .marketplace(config.marketplace)
//!     .settings(config.flow_settings())
//!     .build();
//!
//! let prompt: ContentId =
//!     "f01701220c2a0c2d0b3ce3e4bd4c2c4c9d84cbf1f3a2f7d4b1a3e1bb2ad1e0f59b8a49e2c".parse()?;
//! let outcome = orchestrator
//!     .run(
//!         "0x601024E27f1C67B28209E24272CED8A31fc8151F".parse()?,
//!         &["prediction-online".to_string()],
//!         &[prompt],
//!         config.delivery_timeout,
//!         config.watch_options(),
//!         CancellationToken::new(),
//!     )
//!     .await?;
//! println!("{:?}", outcome.delivery.record);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use alloy_core::sol_types::{SolCall, SolEvent};
use alloy_primitives::{Address, Bytes, TxHash, U256};
use bon::Builder;
use mech_core::{
    descriptor::PlanDescriptorSource,
    errors::{Error, LedgerError, Result, Stage},
    ledger::{ContractCall, LedgerGateway, Receipt},
    types::{ContentId, Did, PaymentModel, Request, RequestId, Submission},
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    contracts::{IMech, IMechMarketplace, read_call},
    execution::{ExecutionContext, ExecutionStrategy},
    payment::PaymentStrategy,
    receipt::{FlowSettings, submit_and_confirm},
    subscription::{SubscriptionContracts, SubscriptionPurchase, SubscriptionWorkflow},
    watcher::{DeliveryWatcher, WatchOptions, WatchOutcome},
};

/// Seconds a priority mech has to deliver before any mech may take over the request.
pub const DEFAULT_RESPONSE_TIMEOUT: u64 = 300;

/// A submitted request together with whatever was delivered for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub submission: Submission,
    pub delivery: WatchOutcome,
}

impl RequestOutcome {
    pub fn tx_hash(&self) -> TxHash {
        self.submission.tx_hash
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.submission.request_ids()
    }
}

#[derive(Builder, Debug)]
pub struct Orchestrator<L, E> {
    pub ledger: L,
    pub executor: E,
    /// The marketplace contract requests are sent to.
    pub marketplace: Address,
    /// Seconds the priority mech has before the request opens to other mechs.
    #[builder(default = DEFAULT_RESPONSE_TIMEOUT)]
    pub response_timeout: u64,
    #[builder(default)]
    pub settings: FlowSettings,
}

impl<L, E> Orchestrator<L, E>
where
    L: LedgerGateway,
    E: ExecutionStrategy,
{
    pub fn context(&self) -> &ExecutionContext {
        self.executor.context()
    }

    /// The payment model recorded against `mech`.
    pub async fn payment_model(&self, mech: Address) -> Result<PaymentModel> {
        let tag = read_call(
            &self.ledger,
            &self.settings.retry,
            mech,
            &IMech::paymentTypeCall {},
        )
        .await
        .map_err(|source| Error::read(Stage::Request, source))?;

        PaymentModel::from_tag(tag).ok_or(Error::UnknownPaymentModel { mech, tag })
    }

    /// Pay for and submit one request per `(tool, prompt)` pair to `target`, in a single
    /// transaction.
    ///
    /// Funds are checked, and any needed allowance granted, before the request is sent.
    /// Returns once the request transaction is mined and its request ids are known.
    pub async fn submit_request(
        &self,
        target: Address,
        tools: &[String],
        prompts: &[ContentId],
    ) -> Result<Submission> {
        if prompts.is_empty() {
            return Err(Error::invalid_input("at least one prompt is required"));
        }
        if tools.len() != prompts.len() {
            return Err(Error::invalid_input(format!(
                "{} tools for {} prompts",
                tools.len(),
                prompts.len()
            )));
        }

        let model = self.payment_model(target).await?;
        let rate = read_call(
            &self.ledger,
            &self.settings.retry,
            target,
            &IMech::maxDeliveryRateCall {},
        )
        .await
        .map_err(|source| Error::read(Stage::Request, source))?;
        let price = rate
            .checked_mul(U256::from(prompts.len()))
            .ok_or_else(|| Error::invalid_input("request price overflows"))?;

        #[cfg(feature = "tracing")]
        tracing::info!(%target, %model, %price, requests = prompts.len(), "Preparing request");

        let payment =
            PaymentStrategy::resolve(&self.ledger, &self.settings, self.marketplace, model).await?;
        let payer = self.context().sender();
        payment
            .ensure_funds(&self.ledger, &self.settings, payer, price)
            .await?;
        payment
            .approve_if_needed(&self.ledger, &self.executor, price, &self.settings)
            .await?;

        let call = self.request_call(target, model, rate, price, prompts);
        let receipt = submit_and_confirm(
            &self.ledger,
            &self.executor,
            call,
            Stage::Request,
            &self.settings,
        )
        .await?;

        let ids = self.request_ids(&receipt)?;
        if ids.len() != prompts.len() {
            return Err(Error::MissingRequestIds {
                tx_hash: receipt.tx_hash,
                expected: prompts.len(),
                found: ids.len(),
            });
        }

        #[cfg(feature = "tracing")]
        tracing::info!(tx_hash = %receipt.tx_hash, ?ids, "Request accepted");

        let requests = ids
            .into_iter()
            .zip(tools.iter().zip(prompts))
            .map(|(request_id, (tool, prompt))| Request {
                priority_target: target,
                tool_id: tool.clone(),
                prompt_ref: prompt.clone(),
                payment_model: model,
                request_id,
                tx_hash: Some(receipt.tx_hash),
            })
            .collect();

        Ok(Submission {
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            requests,
        })
    }

    fn request_call(
        &self,
        target: Address,
        model: PaymentModel,
        rate: U256,
        price: U256,
        prompts: &[ContentId],
    ) -> ContractCall {
        let response_timeout = U256::from(self.response_timeout);
        let data = match prompts {
            [prompt] => IMechMarketplace::requestCall {
                requestData: Bytes::copy_from_slice(prompt.digest().as_slice()),
                maxDeliveryRate: rate,
                paymentType: model.tag(),
                priorityMech: target,
                responseTimeout: response_timeout,
                paymentData: Bytes::new(),
            }
            .abi_encode(),
            _ => IMechMarketplace::requestBatchCall {
                requestDatas: prompts
                    .iter()
                    .map(|p| Bytes::copy_from_slice(p.digest().as_slice()))
                    .collect(),
                maxDeliveryRate: rate,
                paymentType: model.tag(),
                priorityMech: target,
                responseTimeout: response_timeout,
                paymentData: Bytes::new(),
            }
            .abi_encode(),
        };

        let call = ContractCall::new(self.marketplace, data);
        if model == PaymentModel::Native {
            call.with_value(price)
        } else {
            call
        }
    }

    /// Request ids announced by the marketplace in `receipt`, in submission order.
    fn request_ids(&self, receipt: &Receipt) -> Result<Vec<RequestId>> {
        let mut ids = Vec::new();
        for log in receipt
            .logs
            .iter()
            .filter(|log| log.address == self.marketplace)
            .filter(|log| {
                log.topics.first() == Some(&IMechMarketplace::MarketplaceRequest::SIGNATURE_HASH)
            })
        {
            let event = IMechMarketplace::MarketplaceRequest::decode_raw_log(
                log.topics.iter().copied(),
                &log.data,
            )
            .map_err(|e| Error::read(Stage::Request, LedgerError::decode(e.to_string())))?;
            ids.extend(event.requestIds.into_iter().map(RequestId));
        }
        Ok(ids)
    }

    /// A watcher over this orchestrator's ledger and marketplace.
    pub fn watcher(&self) -> DeliveryWatcher<'_, L> {
        DeliveryWatcher::new(&self.ledger, self.marketplace).with_retry(self.settings.retry)
    }

    /// Wait for deliveries of `ids` until `deadline` or cancellation.
    pub async fn await_delivery(
        &self,
        ids: &[RequestId],
        deadline: Instant,
        options: WatchOptions,
        cancel: CancellationToken,
    ) -> Result<WatchOutcome> {
        self.watcher().watch(ids, deadline, options, cancel).await
    }

    /// Submit a request and wait up to `timeout` for its deliveries.
    ///
    /// The delivery search starts at the request's block unless `options` says otherwise.
    /// A token cancelled before submission stops the run with [`Error::Cancelled`]; once the
    /// request is sent, cancelling only ends the wait.
    pub async fn run(
        &self,
        target: Address,
        tools: &[String],
        prompts: &[ContentId],
        timeout: Duration,
        options: WatchOptions,
        cancel: CancellationToken,
    ) -> Result<RequestOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                stage: Stage::Request,
            });
        }
        let submission = self.submit_request(target, tools, prompts).await?;
        let deadline = Instant::now() + timeout;
        let options = WatchOptions {
            from_block: options.from_block.or(submission.block_number),
            ..options
        };
        let delivery = self
            .await_delivery(&submission.request_ids(), deadline, options, cancel)
            .await?;

        Ok(RequestOutcome {
            submission,
            delivery,
        })
    }

    /// The subscription workflow over this orchestrator's ledger and executor.
    pub fn subscription<'a, D: PlanDescriptorSource>(
        &'a self,
        descriptors: &'a D,
        contracts: SubscriptionContracts,
    ) -> SubscriptionWorkflow<'a, L, E, D> {
        SubscriptionWorkflow::new(&self.ledger, &self.executor, descriptors, contracts)
            .with_settings(self.settings)
    }

    /// Buy the subscription plan identified by `plan`.
    pub async fn purchase_subscription<D: PlanDescriptorSource>(
        &self,
        plan: &Did,
        descriptors: &D,
        contracts: SubscriptionContracts,
    ) -> Result<SubscriptionPurchase> {
        self.subscription(descriptors, contracts)
            .purchase(plan)
            .await
    }
}
