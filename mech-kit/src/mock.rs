//! In-memory collaborators for tests and local experiments.
//!
//! [`MockLedger`] decodes calldata for the contracts in [`crate::contracts`] and applies
//! their effects to in-memory balances, allowances, requests and agreements. Proxy wallet
//! executions are unwrapped and their owner signature checked, so every recorded
//! [`SubmittedTx`] shows both the signing key and the effective sender. Failures, reverts
//! and slow receipts can be injected.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use alloy_core::sol_types::{SolCall, SolEvent, SolStruct, SolValue};
use alloy_primitives::{Address, B256, Bytes, Signature, TxHash, U256, keccak256};
use mech_core::{
    content::ContentStore,
    descriptor::{DescriptorError, PlanDescriptor, PlanDescriptorSource},
    errors::LedgerError,
    ledger::{
        ContractCall, KeySigner, LedgerGateway, LogEntry, LogQuery, Receipt, ReceiptStatus,
        TxParams,
    },
    types::{ContentId, Did, PaymentModel, RequestId},
};

use crate::{
    contracts::{
        IBalanceTracker, ICondition, IERC20, IERC1155, IMech, IMechMarketplace,
        INFTSalesTemplate, ISafe, ISubscriptionProvider, SafeTx,
    },
    execution::safe_domain,
    subscription::{
        SubscriptionContracts, agreement_id, condition_id, escrow_payment_hash,
        lock_payment_hash, transfer_nft_hash,
    },
};

/// A transaction the mock ledger accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTx {
    pub tx_hash: TxHash,
    /// Key that signed the outer transaction.
    pub signer: Address,
    /// Outer transaction target.
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    /// Sender of the effective call: the proxy wallet for unwrapped proxy executions, the
    /// signer otherwise.
    pub sender: Address,
    pub target: Address,
    pub effective_value: U256,
    pub effective_data: Bytes,
    pub reverted: bool,
}

impl SubmittedTx {
    /// Selector of the effective call.
    pub fn selector(&self) -> Option<[u8; 4]> {
        selector_of(&self.effective_data)
    }
}

fn selector_of(data: &[u8]) -> Option<[u8; 4]> {
    data.get(..4).map(|s| [s[0], s[1], s[2], s[3]])
}

fn decode<C: SolCall>(data: &[u8]) -> Result<C, LedgerError> {
    C::abi_decode(data).map_err(|e| LedgerError::decode(e.to_string()))
}

fn execution_reverted() -> LedgerError {
    LedgerError::Rpc {
        code: -32000,
        message: "execution reverted".into(),
    }
}

#[derive(Debug, Clone, Default)]
struct TokenState {
    balances: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
}

#[derive(Debug, Clone, Copy)]
struct MechState {
    payment_type: B256,
    max_delivery_rate: U256,
}

#[derive(Debug, Clone, Copy)]
struct TrackerState {
    address: Address,
    token: Address,
    nft: Address,
    token_id: U256,
}

#[derive(Debug, Clone, Copy)]
struct SafeState {
    owner: Address,
    nonce: U256,
}

#[derive(Debug, Clone)]
struct ScheduledDelivery {
    mech: Address,
    data: Bytes,
    after_polls: u32,
}

#[derive(Debug, Clone)]
struct RequestState {
    priority_mech: Address,
    requester: Address,
    response_timeout: U256,
    delivery_rate: U256,
    payment_type: B256,
    polls: u32,
    delivery_mech: Option<Address>,
    delivery: Option<ScheduledDelivery>,
}

#[derive(Debug, Clone)]
struct StoredAgreement {
    conditions: [B256; 3],
    fulfilled: bool,
}

#[derive(Debug, Clone)]
struct PendingReceipt {
    remaining_polls: u32,
    status: ReceiptStatus,
}

/// The sender, target, value and calldata a transaction actually executes with.
#[derive(Debug, Clone)]
struct Effective {
    from: Address,
    to: Address,
    value: U256,
    data: Bytes,
}

#[derive(Debug, Clone, Default)]
struct MockState {
    chain_id: u64,
    marketplace: Address,
    block_number: u64,
    tx_counter: u64,
    request_counter: u64,
    native: HashMap<Address, U256>,
    tokens: HashMap<Address, TokenState>,
    nfts: HashMap<(Address, U256, Address), U256>,
    mechs: HashMap<Address, MechState>,
    trackers: HashMap<B256, TrackerState>,
    prepaid: HashMap<(Address, Address), U256>,
    safes: HashMap<Address, SafeState>,
    subscription: Option<SubscriptionContracts>,
    generate_id_overrides: HashMap<Address, B256>,
    agreements: HashMap<B256, StoredAgreement>,
    requests: HashMap<B256, RequestState>,
    auto_delivery: Option<ScheduledDelivery>,
    logs: Vec<LogEntry>,
    receipts: HashMap<TxHash, PendingReceipt>,
    receipt_delay: u32,
    submissions: Vec<SubmittedTx>,
    submission_attempts: u32,
    submission_failures: VecDeque<LedgerError>,
    read_failures: VecDeque<LedgerError>,
    reads: u32,
    reverts: HashMap<[u8; 4], String>,
}

impl MockState {
    fn next_hash(&mut self, from: Address) -> TxHash {
        self.tx_counter += 1;
        keccak256((from, U256::from(self.tx_counter)).abi_encode_params())
    }

    fn take_read_failure(&mut self) -> Result<(), LedgerError> {
        self.reads += 1;
        match self.read_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn read(&mut self, call: &ContractCall) -> Result<Vec<u8>, LedgerError> {
        self.take_read_failure()?;
        let selector = selector_of(&call.data).ok_or_else(execution_reverted)?;

        if call.to == self.marketplace {
            return self.read_marketplace(selector, &call.data);
        }
        if let Some(token) = self.tokens.get(&call.to) {
            return match selector {
                IERC20::balanceOfCall::SELECTOR => {
                    let args: IERC20::balanceOfCall = decode(&call.data)?;
                    let balance = token.balances.get(&args.account).copied();
                    Ok(balance.unwrap_or_default().abi_encode())
                }
                IERC20::allowanceCall::SELECTOR => {
                    let args: IERC20::allowanceCall = decode(&call.data)?;
                    let allowance = token.allowances.get(&(args.owner, args.spender)).copied();
                    Ok(allowance.unwrap_or_default().abi_encode())
                }
                _ => Err(execution_reverted()),
            };
        }
        if let Some(mech) = self.mechs.get(&call.to) {
            return match selector {
                IMech::paymentTypeCall::SELECTOR => Ok(mech.payment_type.abi_encode()),
                IMech::maxDeliveryRateCall::SELECTOR => Ok(mech.max_delivery_rate.abi_encode()),
                _ => Err(execution_reverted()),
            };
        }
        if let Some(tracker) = self.trackers.values().find(|t| t.address == call.to) {
            return match selector {
                IBalanceTracker::tokenCall::SELECTOR => Ok(tracker.token.abi_encode()),
                IBalanceTracker::subscriptionNFTCall::SELECTOR => Ok(tracker.nft.abi_encode()),
                IBalanceTracker::subscriptionTokenIdCall::SELECTOR => {
                    Ok(tracker.token_id.abi_encode())
                }
                IBalanceTracker::mapRequesterBalancesCall::SELECTOR => {
                    let args: IBalanceTracker::mapRequesterBalancesCall = decode(&call.data)?;
                    let prepaid = self.prepaid.get(&(call.to, args.requester)).copied();
                    Ok(prepaid.unwrap_or_default().abi_encode())
                }
                _ => Err(execution_reverted()),
            };
        }
        if let Some(safe) = self.safes.get(&call.to) {
            return match selector {
                ISafe::nonceCall::SELECTOR => Ok(safe.nonce.abi_encode()),
                _ => Err(execution_reverted()),
            };
        }
        if selector == ICondition::generateIdCall::SELECTOR && self.is_condition(call.to) {
            let args: ICondition::generateIdCall = decode(&call.data)?;
            let id = self
                .generate_id_overrides
                .get(&call.to)
                .copied()
                .unwrap_or_else(|| condition_id(args.agreementId, call.to, args.valueHash));
            return Ok(id.abi_encode());
        }
        if selector == IERC1155::balanceOfCall::SELECTOR {
            let args: IERC1155::balanceOfCall = decode(&call.data)?;
            let balance = self.nfts.get(&(call.to, args.id, args.account)).copied();
            return Ok(balance.unwrap_or_default().abi_encode());
        }
        Err(execution_reverted())
    }

    fn is_condition(&self, address: Address) -> bool {
        self.subscription.is_some_and(|c| {
            [
                c.lock_payment_condition,
                c.transfer_nft_condition,
                c.escrow_payment_condition,
            ]
            .contains(&address)
        })
    }

    fn read_marketplace(&mut self, selector: [u8; 4], data: &[u8]) -> Result<Vec<u8>, LedgerError> {
        match selector {
            IMechMarketplace::mapPaymentTypeBalanceTrackersCall::SELECTOR => {
                let args: IMechMarketplace::mapPaymentTypeBalanceTrackersCall = decode(data)?;
                let tracker = self.trackers.get(&args.paymentType).map(|t| t.address);
                Ok(tracker.unwrap_or_default().abi_encode())
            }
            IMechMarketplace::mapRequestIdInfosCall::SELECTOR => {
                let args: IMechMarketplace::mapRequestIdInfosCall = decode(data)?;
                Ok(self.poll_request(args.requestId))
            }
            _ => Err(execution_reverted()),
        }
    }

    /// Answer `mapRequestIdInfos`, delivering the request once its scheduled poll count
    /// is reached.
    fn poll_request(&mut self, id: B256) -> Vec<u8> {
        let block = self.block_number;
        self.tx_counter += 1;
        let delivery_hash = keccak256((id, U256::from(self.tx_counter)).abi_encode_params());

        let Some(request) = self.requests.get_mut(&id) else {
            return (
                Address::ZERO,
                Address::ZERO,
                Address::ZERO,
                U256::ZERO,
                U256::ZERO,
                B256::ZERO,
            )
                .abi_encode_params();
        };

        request.polls += 1;
        if request.delivery_mech.is_none()
            && let Some(delivery) = &request.delivery
            && request.polls >= delivery.after_polls
        {
            let event = IMech::Deliver {
                mech: delivery.mech,
                mechServiceMultisig: delivery.mech,
                requestId: id,
                deliveryRate: request.delivery_rate,
                data: delivery.data.clone(),
            };
            let log = event.encode_log_data();
            self.logs.push(LogEntry {
                address: delivery.mech,
                topics: log.topics().to_vec(),
                data: log.data,
                block_number: Some(block),
                tx_hash: Some(delivery_hash),
            });
            request.delivery_mech = Some(delivery.mech);
        }

        (
            request.priority_mech,
            request.delivery_mech.unwrap_or_default(),
            request.requester,
            request.response_timeout,
            request.delivery_rate,
            request.payment_type,
        )
            .abi_encode_params()
    }

    fn submit(&mut self, signer: Address, call: &ContractCall) -> Result<TxHash, LedgerError> {
        self.submission_attempts += 1;
        if let Some(err) = self.submission_failures.pop_front() {
            return Err(err);
        }

        let tx_hash = self.next_hash(signer);
        self.block_number += 1;
        let block = self.block_number;

        let mut next = self.clone();
        let (effective, result) = next.execute(signer, call, tx_hash, block);
        let status = match result {
            Ok(logs) => {
                *self = next;
                ReceiptStatus::Success(Receipt {
                    tx_hash,
                    block_number: Some(block),
                    logs,
                })
            }
            Err(reason) => ReceiptStatus::Reverted {
                reason: Some(reason),
            },
        };

        self.submissions.push(SubmittedTx {
            tx_hash,
            signer,
            to: call.to,
            value: call.value,
            data: call.data.clone(),
            sender: effective.from,
            target: effective.to,
            effective_value: effective.value,
            effective_data: effective.data,
            reverted: matches!(status, ReceiptStatus::Reverted { .. }),
        });
        self.receipts.insert(
            tx_hash,
            PendingReceipt {
                remaining_polls: self.receipt_delay,
                status,
            },
        );
        Ok(tx_hash)
    }

    fn execute(
        &mut self,
        signer: Address,
        call: &ContractCall,
        tx_hash: TxHash,
        block: u64,
    ) -> (Effective, Result<Vec<LogEntry>, String>) {
        match self.unwrap_proxy(signer, call) {
            Ok(effective) => {
                let result = self.apply(&effective, tx_hash, block);
                (effective, result)
            }
            Err(reason) => (
                Effective {
                    from: signer,
                    to: call.to,
                    value: call.value,
                    data: call.data.clone(),
                },
                Err(reason),
            ),
        }
    }

    fn unwrap_proxy(&mut self, signer: Address, call: &ContractCall) -> Result<Effective, String> {
        let outer = Effective {
            from: signer,
            to: call.to,
            value: call.value,
            data: call.data.clone(),
        };
        let Some(safe) = self.safes.get(&call.to).copied() else {
            return Ok(outer);
        };
        if selector_of(&call.data) != Some(ISafe::execTransactionCall::SELECTOR) {
            return Ok(outer);
        }

        let exec: ISafe::execTransactionCall =
            decode(&call.data).map_err(|e| format!("GS000: {e}"))?;
        let safe_tx = SafeTx {
            to: exec.to,
            value: exec.value,
            data: exec.data.clone(),
            operation: exec.operation,
            safeTxGas: exec.safeTxGas,
            baseGas: exec.baseGas,
            gasPrice: exec.gasPrice,
            gasToken: exec.gasToken,
            refundReceiver: exec.refundReceiver,
            nonce: safe.nonce,
        };
        let hash = safe_tx.eip712_signing_hash(&safe_domain(self.chain_id, call.to));
        let signature = Signature::try_from(exec.signatures.as_ref())
            .map_err(|_| "GS020: signatures data too short".to_string())?;
        let recovered = signature
            .recover_address_from_prehash(&hash)
            .map_err(|_| "GS026: invalid owner provided".to_string())?;
        if recovered != safe.owner {
            return Err("GS026: invalid owner provided".into());
        }

        if let Some(state) = self.safes.get_mut(&call.to) {
            state.nonce += U256::from(1u64);
        }
        Ok(Effective {
            from: call.to,
            to: exec.to,
            value: exec.value,
            data: exec.data,
        })
    }

    fn apply(
        &mut self,
        effective: &Effective,
        tx_hash: TxHash,
        block: u64,
    ) -> Result<Vec<LogEntry>, String> {
        let selector = selector_of(&effective.data);
        if let Some(reason) = selector.and_then(|s| self.reverts.get(&s)) {
            return Err(reason.clone());
        }
        if !effective.value.is_zero() {
            self.move_native(effective.from, effective.to, effective.value)?;
        }
        let Some(selector) = selector else {
            return Ok(Vec::new());
        };
        let data = &effective.data;

        if self.tokens.contains_key(&effective.to) && selector == IERC20::approveCall::SELECTOR {
            let args: IERC20::approveCall = decode(data).map_err(|e| e.to_string())?;
            if let Some(token) = self.tokens.get_mut(&effective.to) {
                token
                    .allowances
                    .insert((effective.from, args.spender), args.amount);
            }
            return Ok(Vec::new());
        }

        if effective.to == self.marketplace {
            return match selector {
                IMechMarketplace::requestCall::SELECTOR => {
                    let args: IMechMarketplace::requestCall =
                        decode(data).map_err(|e| e.to_string())?;
                    self.request(
                        effective,
                        vec![args.requestData],
                        args.maxDeliveryRate,
                        args.paymentType,
                        args.priorityMech,
                        args.responseTimeout,
                        tx_hash,
                        block,
                    )
                }
                IMechMarketplace::requestBatchCall::SELECTOR => {
                    let args: IMechMarketplace::requestBatchCall =
                        decode(data).map_err(|e| e.to_string())?;
                    self.request(
                        effective,
                        args.requestDatas,
                        args.maxDeliveryRate,
                        args.paymentType,
                        args.priorityMech,
                        args.responseTimeout,
                        tx_hash,
                        block,
                    )
                }
                _ => Err("unknown marketplace function".into()),
            };
        }

        if let Some(contracts) = self.subscription {
            if effective.to == contracts.sales_template
                && selector == INFTSalesTemplate::createAgreementAndPayEscrowCall::SELECTOR
            {
                return self.create_agreement(effective, contracts);
            }
            if effective.to == contracts.subscription_provider
                && selector == ISubscriptionProvider::fulfillCall::SELECTOR
            {
                return self.fulfill(effective, contracts);
            }
        }

        Ok(Vec::new())
    }

    fn move_native(&mut self, from: Address, to: Address, amount: U256) -> Result<(), String> {
        let balance = self.native.entry(from).or_default();
        if *balance < amount {
            return Err("insufficient native balance".into());
        }
        *balance -= amount;
        *self.native.entry(to).or_default() += amount;
        Ok(())
    }

    fn pull_tokens(
        &mut self,
        token: Address,
        owner: Address,
        spender: Address,
        amount: U256,
    ) -> Result<(), String> {
        let state = self
            .tokens
            .get_mut(&token)
            .ok_or("payment token does not exist")?;
        let allowance = state.allowances.entry((owner, spender)).or_default();
        if *allowance < amount {
            return Err("ERC20: insufficient allowance".into());
        }
        *allowance -= amount;
        let balance = state.balances.entry(owner).or_default();
        if *balance < amount {
            return Err("ERC20: transfer amount exceeds balance".into());
        }
        *balance -= amount;
        *state.balances.entry(spender).or_default() += amount;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn request(
        &mut self,
        effective: &Effective,
        datas: Vec<Bytes>,
        max_delivery_rate: U256,
        payment_type: B256,
        priority_mech: Address,
        response_timeout: U256,
        tx_hash: TxHash,
        block: u64,
    ) -> Result<Vec<LogEntry>, String> {
        let mech = *self
            .mechs
            .get(&priority_mech)
            .ok_or("priority mech is not registered")?;
        if max_delivery_rate < mech.max_delivery_rate {
            return Err("delivery rate below mech's rate".into());
        }
        if payment_type != mech.payment_type {
            return Err("payment type does not match mech".into());
        }
        let model = PaymentModel::from_tag(payment_type).ok_or("unknown payment type")?;
        let price = max_delivery_rate * U256::from(datas.len());
        let requester = effective.from;

        match model {
            PaymentModel::Native => {
                if effective.value < price {
                    return Err("insufficient payment value".into());
                }
            }
            PaymentModel::FungibleToken => {
                let tracker = *self
                    .trackers
                    .get(&payment_type)
                    .ok_or("no balance tracker")?;
                self.pull_tokens(tracker.token, requester, tracker.address, price)?;
            }
            PaymentModel::SubscriptionNative | PaymentModel::SubscriptionToken => {
                let tracker = *self
                    .trackers
                    .get(&payment_type)
                    .ok_or("no balance tracker")?;
                let credits = self
                    .nfts
                    .get(&(tracker.nft, tracker.token_id, requester))
                    .copied()
                    .unwrap_or_default();
                let prepaid = self
                    .prepaid
                    .get(&(tracker.address, requester))
                    .copied()
                    .unwrap_or_default();
                if credits.is_zero() && prepaid.is_zero() {
                    return Err("no subscription balance".into());
                }
            }
        }

        let mut ids = Vec::with_capacity(datas.len());
        for _ in &datas {
            self.request_counter += 1;
            let id = keccak256((requester, U256::from(self.request_counter)).abi_encode_params());
            self.requests.insert(
                id,
                RequestState {
                    priority_mech,
                    requester,
                    response_timeout,
                    delivery_rate: max_delivery_rate,
                    payment_type,
                    polls: 0,
                    delivery_mech: None,
                    delivery: self.auto_delivery.clone(),
                },
            );
            ids.push(id);
        }

        let event = IMechMarketplace::MarketplaceRequest {
            priorityMech: priority_mech,
            requester,
            numRequests: U256::from(ids.len()),
            requestIds: ids,
            requestDatas: datas,
        };
        let log = event.encode_log_data();
        Ok(vec![LogEntry {
            address: self.marketplace,
            topics: log.topics().to_vec(),
            data: log.data,
            block_number: Some(block),
            tx_hash: Some(tx_hash),
        }])
    }

    fn create_agreement(
        &mut self,
        effective: &Effective,
        contracts: SubscriptionContracts,
    ) -> Result<Vec<LogEntry>, String> {
        let args: INFTSalesTemplate::createAgreementAndPayEscrowCall =
            decode(&effective.data).map_err(|e| e.to_string())?;
        let [lock_hash, transfer_hash, escrow_hash] = args.conditionIds[..] else {
            return Err("expected three conditions".into());
        };

        let expected_lock = lock_payment_hash(
            Did(args.did),
            args.rewardAddress,
            args.tokenAddress,
            &args.amounts,
            &args.receivers,
        );
        if lock_hash != expected_lock {
            return Err("lock payment condition hash mismatch".into());
        }

        let id = agreement_id(args.id, effective.from);
        if self.agreements.contains_key(&id) {
            return Err("agreement already exists".into());
        }

        let total = args
            .amounts
            .iter()
            .fold(U256::ZERO, |acc, amount| acc.saturating_add(*amount));
        if args.tokenAddress == Address::ZERO {
            if effective.value < total {
                return Err("insufficient payment value".into());
            }
        } else {
            self.pull_tokens(
                args.tokenAddress,
                effective.from,
                contracts.lock_payment_condition,
                total,
            )?;
        }

        self.agreements.insert(
            id,
            StoredAgreement {
                conditions: [
                    condition_id(id, contracts.lock_payment_condition, lock_hash),
                    condition_id(id, contracts.transfer_nft_condition, transfer_hash),
                    condition_id(id, contracts.escrow_payment_condition, escrow_hash),
                ],
                fulfilled: false,
            },
        );
        Ok(Vec::new())
    }

    fn fulfill(
        &mut self,
        effective: &Effective,
        contracts: SubscriptionContracts,
    ) -> Result<Vec<LogEntry>, String> {
        let args: ISubscriptionProvider::fulfillCall =
            decode(&effective.data).map_err(|e| e.to_string())?;
        let stored = self
            .agreements
            .get(&args.agreementId)
            .cloned()
            .ok_or("unknown agreement")?;
        if stored.fulfilled {
            return Err("agreement already fulfilled".into());
        }

        let delegate = &args.fulfillForDelegateParams;
        let params = &args.fulfillParams;
        let [lock_id, transfer_id, escrow_id] = stored.conditions;
        if delegate.lockPaymentCondition != lock_id || params.lockCondition != lock_id {
            return Err("lock condition id mismatch".into());
        }

        let did = Did(args.did);
        let transfer_hash = transfer_nft_hash(
            did,
            delegate.nftHolder,
            delegate.nftReceiver,
            delegate.nftAmount,
            delegate.lockPaymentCondition,
            delegate.nftContractAddress,
            delegate.transfer,
        );
        if condition_id(args.agreementId, contracts.transfer_nft_condition, transfer_hash)
            != transfer_id
        {
            return Err("transfer condition id mismatch".into());
        }

        let escrow_hash = escrow_payment_hash(
            did,
            &params.amounts,
            &params.receivers,
            params.returnAddress,
            params.lockPaymentAddress,
            params.tokenAddress,
            params.lockCondition,
            &params.releaseConditions,
        );
        if condition_id(args.agreementId, contracts.escrow_payment_condition, escrow_hash)
            != escrow_id
        {
            return Err("escrow condition id mismatch".into());
        }

        let token_id = U256::from_be_bytes(args.did.0);
        *self
            .nfts
            .entry((delegate.nftContractAddress, token_id, delegate.nftReceiver))
            .or_default() += delegate.nftAmount;
        if let Some(agreement) = self.agreements.get_mut(&args.agreementId) {
            agreement.fulfilled = true;
        }
        Ok(Vec::new())
    }
}

/// An in-memory ledger implementing [`LedgerGateway`].
#[derive(Debug)]
pub struct MockLedger {
    state: Mutex<MockState>,
}

impl MockLedger {
    pub fn new(chain_id: u64, marketplace: Address) -> Self {
        MockLedger {
            state: Mutex::new(MockState {
                chain_id,
                marketplace,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn chain_id(&self) -> u64 {
        self.state().chain_id
    }

    pub fn marketplace(&self) -> Address {
        self.state().marketplace
    }

    pub fn set_native_balance(&self, account: Address, amount: U256) {
        self.state().native.insert(account, amount);
    }

    pub fn native_balance_of(&self, account: Address) -> U256 {
        self.state()
            .native
            .get(&account)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_token_balance(&self, token: Address, owner: Address, amount: U256) {
        self.state()
            .tokens
            .entry(token)
            .or_default()
            .balances
            .insert(owner, amount);
    }

    pub fn token_balance(&self, token: Address, owner: Address) -> U256 {
        self.state()
            .tokens
            .get(&token)
            .and_then(|t| t.balances.get(&owner).copied())
            .unwrap_or_default()
    }

    pub fn set_allowance(&self, token: Address, owner: Address, spender: Address, amount: U256) {
        self.state()
            .tokens
            .entry(token)
            .or_default()
            .allowances
            .insert((owner, spender), amount);
    }

    pub fn allowance(&self, token: Address, owner: Address, spender: Address) -> U256 {
        self.state()
            .tokens
            .get(&token)
            .and_then(|t| t.allowances.get(&(owner, spender)).copied())
            .unwrap_or_default()
    }

    pub fn set_nft_balance(&self, nft: Address, token_id: U256, owner: Address, amount: U256) {
        self.state().nfts.insert((nft, token_id, owner), amount);
    }

    pub fn nft_balance(&self, nft: Address, token_id: U256, owner: Address) -> U256 {
        self.state()
            .nfts
            .get(&(nft, token_id, owner))
            .copied()
            .unwrap_or_default()
    }

    /// Register a mech paid under `model` at `max_delivery_rate` per request.
    pub fn add_mech(&self, mech: Address, model: PaymentModel, max_delivery_rate: U256) {
        self.add_mech_with_tag(mech, model.tag(), max_delivery_rate);
    }

    /// Register a mech reporting an arbitrary payment type tag.
    pub fn add_mech_with_tag(&self, mech: Address, payment_type: B256, max_delivery_rate: U256) {
        self.state().mechs.insert(
            mech,
            MechState {
                payment_type,
                max_delivery_rate,
            },
        );
    }

    /// Register the balance tracker for a token-paid model.
    pub fn add_token_tracker(&self, model: PaymentModel, tracker: Address, token: Address) {
        let mut state = self.state();
        state.tokens.entry(token).or_default();
        state.trackers.insert(
            model.tag(),
            TrackerState {
                address: tracker,
                token,
                nft: Address::ZERO,
                token_id: U256::ZERO,
            },
        );
    }

    /// Register the balance tracker for a subscription model.
    pub fn add_subscription_tracker(
        &self,
        model: PaymentModel,
        tracker: Address,
        nft: Address,
        token_id: U256,
    ) {
        self.state().trackers.insert(
            model.tag(),
            TrackerState {
                address: tracker,
                token: Address::ZERO,
                nft,
                token_id,
            },
        );
    }

    pub fn set_prepaid_balance(&self, tracker: Address, requester: Address, amount: U256) {
        self.state().prepaid.insert((tracker, requester), amount);
    }

    /// Register a proxy wallet with a single owner.
    pub fn add_safe(&self, safe: Address, owner: Address) {
        self.state().safes.insert(
            safe,
            SafeState {
                owner,
                nonce: U256::ZERO,
            },
        );
    }

    pub fn safe_nonce(&self, safe: Address) -> Option<U256> {
        self.state().safes.get(&safe).map(|s| s.nonce)
    }

    pub fn set_subscription_contracts(&self, contracts: SubscriptionContracts) {
        self.state().subscription = Some(contracts);
    }

    /// Make `condition`'s `generateId` answer `id` regardless of its inputs.
    pub fn override_generate_id(&self, condition: Address, id: B256) {
        self.state().generate_id_overrides.insert(condition, id);
    }

    /// Full condition ids stored for an agreement, in lock, transfer, escrow order.
    pub fn agreement_conditions(&self, agreement_id: B256) -> Option<[B256; 3]> {
        self.state()
            .agreements
            .get(&agreement_id)
            .map(|a| a.conditions)
    }

    pub fn is_fulfilled(&self, agreement_id: B256) -> bool {
        self.state()
            .agreements
            .get(&agreement_id)
            .is_some_and(|a| a.fulfilled)
    }

    /// Deliver `id` from `mech` once the marketplace has been polled `after_polls` times
    /// for it.
    pub fn schedule_delivery(&self, id: RequestId, mech: Address, data: Bytes, after_polls: u32) {
        if let Some(request) = self.state().requests.get_mut(&id.0) {
            request.delivery = Some(ScheduledDelivery {
                mech,
                data,
                after_polls,
            });
        }
    }

    /// Schedule a delivery for every request created from now on.
    pub fn deliver_future_requests(&self, mech: Address, data: Bytes, after_polls: u32) {
        self.state().auto_delivery = Some(ScheduledDelivery {
            mech,
            data,
            after_polls,
        });
    }

    /// Times the marketplace was asked about `id`.
    pub fn request_polls(&self, id: RequestId) -> u32 {
        self.state()
            .requests
            .get(&id.0)
            .map(|r| r.polls)
            .unwrap_or_default()
    }

    /// Fail the next reads, in order, with `errors`.
    pub fn fail_reads(&self, errors: impl IntoIterator<Item = LedgerError>) {
        self.state().read_failures.extend(errors);
    }

    /// Fail the next submission before it gets a hash.
    pub fn fail_next_submission(&self, error: LedgerError) {
        self.state().submission_failures.push_back(error);
    }

    /// Revert every effective call with `selector`.
    pub fn revert_selector(&self, selector: [u8; 4], reason: impl Into<String>) {
        self.state().reverts.insert(selector, reason.into());
    }

    /// Keep new receipts pending for `polls` receipt queries.
    pub fn delay_receipts(&self, polls: u32) {
        self.state().receipt_delay = polls;
    }

    pub fn submissions(&self) -> Vec<SubmittedTx> {
        self.state().submissions.clone()
    }

    /// Submissions attempted, including those that failed before getting a hash.
    pub fn submission_attempts(&self) -> u32 {
        self.state().submission_attempts
    }

    /// Reads served or failed so far.
    pub fn reads(&self) -> u32 {
        self.state().reads
    }
}

impl LedgerGateway for MockLedger {
    async fn read(&self, call: &ContractCall) -> Result<Bytes, LedgerError> {
        self.state().read(call).map(Bytes::from)
    }

    async fn native_balance(&self, account: Address) -> Result<U256, LedgerError> {
        let mut state = self.state();
        state.take_read_failure()?;
        Ok(state.native.get(&account).copied().unwrap_or_default())
    }

    async fn call<S: KeySigner>(
        &self,
        signer: &S,
        call: &ContractCall,
        _params: &TxParams,
    ) -> Result<TxHash, LedgerError> {
        self.state().submit(signer.address(), call)
    }

    async fn transfer<S: KeySigner>(
        &self,
        signer: &S,
        to: Address,
        amount: U256,
        _gas: Option<u64>,
    ) -> Result<TxHash, LedgerError> {
        let call = ContractCall::new(to, Bytes::new()).with_value(amount);
        self.state().submit(signer.address(), &call)
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<ReceiptStatus, LedgerError> {
        let mut state = self.state();
        let Some(pending) = state.receipts.get_mut(&tx_hash) else {
            return Ok(ReceiptStatus::Pending);
        };
        if pending.remaining_polls > 0 {
            pending.remaining_polls -= 1;
            return Ok(ReceiptStatus::Pending);
        }
        Ok(pending.status.clone())
    }

    async fn logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, LedgerError> {
        let mut state = self.state();
        state.take_read_failure()?;
        Ok(state
            .logs
            .iter()
            .filter(|log| log.address == query.address)
            .filter(|log| query.topic0.is_none_or(|t| log.topics.first() == Some(&t)))
            .filter(|log| match (query.from_block, log.block_number) {
                (Some(from), Some(block)) => block >= from,
                _ => true,
            })
            .cloned()
            .collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryStoreError {
    #[error("no content stored under {0}")]
    NotFound(ContentId),
}

/// A content store keeping documents in memory, addressed by their keccak-256 digest.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    documents: Mutex<HashMap<B256, Vec<u8>>>,
}

impl ContentStore for MemoryContentStore {
    type Error = MemoryStoreError;

    async fn upload(&self, bytes: Vec<u8>) -> Result<ContentId, Self::Error> {
        let digest = keccak256(&bytes);
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(digest, bytes);
        Ok(ContentId::from_digest(digest))
    }

    async fn download(&self, id: &ContentId) -> Result<Vec<u8>, Self::Error> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id.digest())
            .cloned()
            .ok_or_else(|| MemoryStoreError::NotFound(id.clone()))
    }
}

/// Plan descriptors served from memory, with injectable failures.
#[derive(Debug, Default)]
pub struct MockDescriptorSource {
    plans: Mutex<HashMap<Did, PlanDescriptor>>,
    failures: Mutex<VecDeque<DescriptorError>>,
}

impl MockDescriptorSource {
    pub fn insert(&self, plan: PlanDescriptor) {
        self.plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plan.did, plan);
    }

    /// Fail the next fetches, in order, with `errors`.
    pub fn fail_fetches(&self, errors: impl IntoIterator<Item = DescriptorError>) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(errors);
    }
}

impl PlanDescriptorSource for MockDescriptorSource {
    async fn fetch_descriptor(&self, did: &Did) -> Result<PlanDescriptor, DescriptorError> {
        if let Some(err) = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            return Err(err);
        }
        self.plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(did)
            .cloned()
            .ok_or(DescriptorError::NotFound(*did))
    }
}
