//! Purchasing a subscription plan.
//!
//! A purchase runs four steps in order and stops at the first failure:
//!
//! 1. balance check: the sender holds the plan's total price;
//! 2. token approval: the lock payment condition may pull the price (token plans only);
//! 3. agreement creation: a fresh seed is drawn, the three condition ids are derived and
//!    `createAgreementAndPayEscrow` is submitted with their value hashes;
//! 4. fulfillment: the subscription provider is asked to fulfill with the full condition
//!    ids derived in step 3.
//!
//! Errors are labelled with the [`SubscriptionStep`] they came from.

mod agreement;

use alloy_core::sol_types::SolCall;
use alloy_primitives::{Address, B256, TxHash, U256};
use bon::Builder;
use mech_core::{
    descriptor::{DescriptorError, PlanDescriptor, PlanDescriptorSource},
    errors::{Error, Result, Stage, SubscriptionStep},
    ledger::{ContractCall, LedgerGateway},
    types::Did,
};
use serde::{Deserialize, Serialize};

pub use agreement::*;

use crate::{
    contracts::{
        FulfillForDelegateParams, FulfillParams, ICondition, INFTSalesTemplate,
        ISubscriptionProvider, read_call,
    },
    execution::ExecutionStrategy,
    payment::PaymentStrategy,
    receipt::{FlowSettings, submit_and_confirm},
};

/// Addresses of the agreement template and its condition contracts.
#[derive(Builder, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionContracts {
    /// Template that creates agreements and locks payment in one call.
    pub sales_template: Address,
    pub lock_payment_condition: Address,
    pub transfer_nft_condition: Address,
    pub escrow_payment_condition: Address,
    /// Contract that fulfills transfer and escrow on the plan owner's behalf.
    pub subscription_provider: Address,
}

/// An agreement whose creation transaction has been mined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedAgreement {
    pub agreement: Agreement,
    pub tx_hash: TxHash,
}

/// Result of a complete purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPurchase {
    pub agreement_id: B256,
    /// `None` for native plans and when the allowance already covered the price.
    pub approval_tx_hash: Option<TxHash>,
    pub agreement_tx_hash: TxHash,
    pub fulfillment_tx_hash: TxHash,
}

fn at(step: SubscriptionStep) -> Stage {
    Stage::Subscription(step)
}

/// The four-step purchase flow, bound to one ledger, executor and descriptor source.
pub struct SubscriptionWorkflow<'a, L, E, D> {
    ledger: &'a L,
    executor: &'a E,
    descriptors: &'a D,
    contracts: SubscriptionContracts,
    settings: FlowSettings,
    verify_derivation: bool,
}

impl<'a, L, E, D> SubscriptionWorkflow<'a, L, E, D>
where
    L: LedgerGateway,
    E: ExecutionStrategy,
    D: PlanDescriptorSource,
{
    pub fn new(
        ledger: &'a L,
        executor: &'a E,
        descriptors: &'a D,
        contracts: SubscriptionContracts,
    ) -> Self {
        SubscriptionWorkflow {
            ledger,
            executor,
            descriptors,
            contracts,
            settings: FlowSettings::default(),
            verify_derivation: true,
        }
    }

    pub fn with_settings(mut self, settings: FlowSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Whether to compare locally derived condition ids with the condition contracts'
    /// `generateId` before creating the agreement. On by default.
    pub fn verify_derivation(mut self, verify: bool) -> Self {
        self.verify_derivation = verify;
        self
    }

    /// The subscriber: the executor's sender, which pays and receives the NFT.
    pub fn sender(&self) -> Address {
        self.executor.context().sender()
    }

    /// Fetch and validate the plan's descriptor, retrying once on transient failures.
    pub async fn fetch_plan(&self, did: &Did) -> Result<PlanDescriptor> {
        let descriptor_error = |source| Error::Descriptor {
            stage: at(SubscriptionStep::BalanceCheck),
            did: *did,
            source,
        };
        let plan = self
            .settings
            .retry
            .run(|| self.descriptors.fetch_descriptor(did))
            .await
            .map_err(descriptor_error)?;
        plan.validate().map_err(descriptor_error)?;
        if plan.did != *did {
            return Err(descriptor_error(DescriptorError::invalid(format!(
                "descriptor describes {}",
                plan.did
            ))));
        }
        Ok(plan)
    }

    fn payment(&self, plan: &PlanDescriptor) -> PaymentStrategy {
        if plan.is_native() {
            PaymentStrategy::Native
        } else {
            PaymentStrategy::FungibleToken {
                token: plan.token_address,
                spender: self.contracts.lock_payment_condition,
            }
        }
    }

    /// Step 1: the sender holds the plan's total price.
    pub async fn check_balance(&self, plan: &PlanDescriptor) -> Result<()> {
        let step = at(SubscriptionStep::BalanceCheck);
        self.payment(plan)
            .ensure_funds(self.ledger, &self.settings, self.sender(), plan.total_price())
            .await
            .map_err(|e| e.at(step))
    }

    /// Step 2: let the lock payment condition pull the price. A no-op for native plans.
    pub async fn approve(&self, plan: &PlanDescriptor) -> Result<Option<TxHash>> {
        let step = at(SubscriptionStep::TokenApproval);
        self.payment(plan)
            .approve_if_needed(
                self.ledger,
                self.executor,
                plan.total_price(),
                &self.settings,
            )
            .await
            .map_err(|e| e.at(step))
    }

    /// Step 3 with a fresh random seed.
    pub async fn create_agreement(&self, plan: &PlanDescriptor) -> Result<CreatedAgreement> {
        let seed = B256::from(rand::random::<[u8; 32]>());
        self.create_agreement_with_seed(plan, seed).await
    }

    /// Step 3: derive the agreement for `seed`, optionally cross-check the condition ids
    /// against the ledger, then create the agreement and lock payment.
    pub async fn create_agreement_with_seed(
        &self,
        plan: &PlanDescriptor,
        seed: B256,
    ) -> Result<CreatedAgreement> {
        let stage = at(SubscriptionStep::AgreementCreation);
        let sender = self.sender();
        let agreement = Agreement::derive(seed, sender, plan, &self.contracts);

        #[cfg(feature = "tracing")]
        tracing::debug!(agreement_id = %agreement.id, %sender, did = %plan.did, "Derived agreement");

        if self.verify_derivation {
            self.verify(&agreement).await?;
        }

        let amounts = plan.amounts_u256();
        let create = INFTSalesTemplate::createAgreementAndPayEscrowCall {
            id: seed,
            did: plan.did.0,
            conditionIds: agreement.value_hashes(),
            timeLocks: vec![U256::ZERO; 3],
            timeOuts: vec![U256::ZERO; 3],
            accessConsumer: sender,
            idx: U256::ZERO,
            rewardAddress: self.contracts.escrow_payment_condition,
            tokenAddress: plan.token_address,
            amounts,
            receivers: plan.receivers.clone(),
        };
        let mut call = ContractCall::new(self.contracts.sales_template, create.abi_encode());
        if plan.is_native() {
            call = call.with_value(plan.total_price());
        }

        let receipt =
            submit_and_confirm(self.ledger, self.executor, call, stage, &self.settings).await?;

        #[cfg(feature = "tracing")]
        tracing::info!(agreement_id = %agreement.id, tx_hash = %receipt.tx_hash, "Agreement created");

        Ok(CreatedAgreement {
            agreement,
            tx_hash: receipt.tx_hash,
        })
    }

    /// Compare every locally derived condition id with the condition contract's own
    /// derivation. Nothing is submitted on a mismatch.
    async fn verify(&self, agreement: &Agreement) -> Result<()> {
        let stage = at(SubscriptionStep::AgreementCreation);
        for condition in agreement.conditions() {
            let onchain = read_call(
                self.ledger,
                &self.settings.retry,
                condition.contract,
                &ICondition::generateIdCall {
                    agreementId: agreement.id,
                    valueHash: condition.value_hash,
                },
            )
            .await
            .map_err(|source| Error::read(stage, source))?;

            if onchain != condition.id {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    condition = %condition.kind,
                    local = %condition.id,
                    %onchain,
                    "Condition id derivation disagrees with the ledger"
                );
                return Err(Error::DerivationMismatch {
                    stage,
                    condition: condition.kind,
                    local: condition.id,
                    onchain,
                });
            }
        }
        Ok(())
    }

    /// Step 4: fulfill transfer and escrow, referencing the full condition ids of
    /// `created`.
    pub async fn fulfill(&self, plan: &PlanDescriptor, created: &CreatedAgreement) -> Result<TxHash> {
        let stage = at(SubscriptionStep::AgreementFulfillment);
        let agreement = &created.agreement;

        let delegate = FulfillForDelegateParams {
            nftHolder: plan.owner,
            nftReceiver: agreement.sender,
            nftAmount: plan.nft_amount.0,
            lockPaymentCondition: agreement.lock.id,
            nftContractAddress: plan.nft_contract,
            transfer: plan.transfer,
            expirationBlock: U256::from(plan.expiration_block),
        };
        let params = FulfillParams {
            amounts: plan.amounts_u256(),
            receivers: plan.receivers.clone(),
            returnAddress: agreement.sender,
            lockPaymentAddress: self.contracts.lock_payment_condition,
            tokenAddress: plan.token_address,
            lockCondition: agreement.lock.id,
            releaseConditions: vec![agreement.transfer.id],
        };
        let fulfill = ISubscriptionProvider::fulfillCall {
            agreementId: agreement.id,
            did: agreement.did.0,
            fulfillForDelegateParams: delegate,
            fulfillParams: params,
        };
        let call = ContractCall::new(self.contracts.subscription_provider, fulfill.abi_encode());

        let receipt =
            submit_and_confirm(self.ledger, self.executor, call, stage, &self.settings).await?;

        #[cfg(feature = "tracing")]
        tracing::info!(agreement_id = %agreement.id, tx_hash = %receipt.tx_hash, "Agreement fulfilled");

        Ok(receipt.tx_hash)
    }

    /// Run all four steps for the plan identified by `did`.
    pub async fn purchase(&self, did: &Did) -> Result<SubscriptionPurchase> {
        let plan = self.fetch_plan(did).await?;

        self.check_balance(&plan).await?;
        let approval_tx_hash = self.approve(&plan).await?;
        let created = self.create_agreement(&plan).await?;
        let fulfillment_tx_hash = self.fulfill(&plan, &created).await?;

        Ok(SubscriptionPurchase {
            agreement_id: created.agreement.id,
            approval_tx_hash,
            agreement_tx_hash: created.tx_hash,
            fulfillment_tx_hash,
        })
    }
}
