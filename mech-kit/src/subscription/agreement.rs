//! Deterministic derivation of agreement and condition ids.
//!
//! Every id is `keccak256` of the ABI encoding of its inputs, matching the condition
//! contracts' own `hashValues`/`generateId`. An agreement commits to three conditions:
//! locking the payment, transferring the subscription NFT and releasing the escrow.

use alloy_core::sol_types::SolValue;
use alloy_primitives::{Address, B256, U256, keccak256};
use mech_core::{descriptor::PlanDescriptor, errors::ConditionKind, types::Did};

use super::SubscriptionContracts;

/// `keccak256(abi.encode(seed, sender))`.
pub fn agreement_id(seed: B256, sender: Address) -> B256 {
    keccak256((seed, sender).abi_encode_params())
}

/// Full condition id: `keccak256(abi.encode(agreementId, conditionContract, valueHash))`.
pub fn condition_id(agreement_id: B256, condition: Address, value_hash: B256) -> B256 {
    keccak256((agreement_id, condition, value_hash).abi_encode_params())
}

pub fn lock_payment_hash(
    did: Did,
    reward_address: Address,
    token_address: Address,
    amounts: &[U256],
    receivers: &[Address],
) -> B256 {
    keccak256(
        (
            did.0,
            reward_address,
            token_address,
            amounts.to_vec(),
            receivers.to_vec(),
        )
            .abi_encode_params(),
    )
}

pub fn transfer_nft_hash(
    did: Did,
    nft_holder: Address,
    nft_receiver: Address,
    nft_amount: U256,
    lock_condition_id: B256,
    nft_contract: Address,
    transfer: bool,
) -> B256 {
    keccak256(
        (
            did.0,
            nft_holder,
            nft_receiver,
            nft_amount,
            lock_condition_id,
            nft_contract,
            transfer,
        )
            .abi_encode_params(),
    )
}

#[allow(clippy::too_many_arguments)]
pub fn escrow_payment_hash(
    did: Did,
    amounts: &[U256],
    receivers: &[Address],
    return_address: Address,
    lock_payment_address: Address,
    token_address: Address,
    lock_condition_id: B256,
    release_conditions: &[B256],
) -> B256 {
    keccak256(
        (
            did.0,
            amounts.to_vec(),
            receivers.to_vec(),
            return_address,
            lock_payment_address,
            token_address,
            lock_condition_id,
            release_conditions.to_vec(),
        )
            .abi_encode_params(),
    )
}

/// One condition of an agreement: the contract that enforces it, the hash of its
/// parameters and the resulting full id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Condition {
    pub kind: ConditionKind,
    pub contract: Address,
    pub value_hash: B256,
    pub id: B256,
}

/// An agreement derived from a seed, a sender and a plan.
///
/// Creation submits the value hashes; fulfillment references the full ids. Both come from
/// the same derivation, so the ids the ledger stores and the ids fulfillment supplies agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agreement {
    pub seed: B256,
    pub id: B256,
    pub did: Did,
    /// The subscriber: consumer of the agreement and receiver of the NFT.
    pub sender: Address,
    pub lock: Condition,
    pub transfer: Condition,
    pub escrow: Condition,
}

impl Agreement {
    pub fn derive(
        seed: B256,
        sender: Address,
        plan: &PlanDescriptor,
        contracts: &SubscriptionContracts,
    ) -> Self {
        let id = agreement_id(seed, sender);
        let amounts = plan.amounts_u256();

        let lock_hash = lock_payment_hash(
            plan.did,
            contracts.escrow_payment_condition,
            plan.token_address,
            &amounts,
            &plan.receivers,
        );
        let lock = Condition {
            kind: ConditionKind::Lock,
            contract: contracts.lock_payment_condition,
            value_hash: lock_hash,
            id: condition_id(id, contracts.lock_payment_condition, lock_hash),
        };

        let transfer_hash = transfer_nft_hash(
            plan.did,
            plan.owner,
            sender,
            plan.nft_amount.0,
            lock.id,
            plan.nft_contract,
            plan.transfer,
        );
        let transfer = Condition {
            kind: ConditionKind::Transfer,
            contract: contracts.transfer_nft_condition,
            value_hash: transfer_hash,
            id: condition_id(id, contracts.transfer_nft_condition, transfer_hash),
        };

        let escrow_hash = escrow_payment_hash(
            plan.did,
            &amounts,
            &plan.receivers,
            sender,
            contracts.lock_payment_condition,
            plan.token_address,
            lock.id,
            &[transfer.id],
        );
        let escrow = Condition {
            kind: ConditionKind::Escrow,
            contract: contracts.escrow_payment_condition,
            value_hash: escrow_hash,
            id: condition_id(id, contracts.escrow_payment_condition, escrow_hash),
        };

        Agreement {
            seed,
            id,
            did: plan.did,
            sender,
            lock,
            transfer,
            escrow,
        }
    }

    pub fn conditions(&self) -> [Condition; 3] {
        [self.lock, self.transfer, self.escrow]
    }

    /// Value hashes in the order the sales template expects them.
    pub fn value_hashes(&self) -> Vec<B256> {
        self.conditions().iter().map(|c| c.value_hash).collect()
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{address, b256};
    use mech_core::types::TokenAmount;

    use super::*;

    fn contracts() -> SubscriptionContracts {
        SubscriptionContracts {
            sales_template: address!("0x1000000000000000000000000000000000000001"),
            lock_payment_condition: address!("0x1000000000000000000000000000000000000002"),
            transfer_nft_condition: address!("0x1000000000000000000000000000000000000003"),
            escrow_payment_condition: address!("0x1000000000000000000000000000000000000004"),
            subscription_provider: address!("0x1000000000000000000000000000000000000005"),
        }
    }

    fn plan() -> PlanDescriptor {
        PlanDescriptor {
            did: Did(b256!(
                "0x0b1c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d7e8f9a0b1c"
            )),
            owner: address!("0x3CB9B3bBfde8501f411bB69Ad3DC07908ED0dE20"),
            nft_contract: address!("0x2000000000000000000000000000000000000001"),
            nft_amount: TokenAmount::from(100u64),
            token_address: address!("0x2000000000000000000000000000000000000002"),
            amounts: vec![TokenAmount::from(990u64), TokenAmount::from(10u64)],
            receivers: vec![
                address!("0x3CB9B3bBfde8501f411bB69Ad3DC07908ED0dE20"),
                address!("0x2000000000000000000000000000000000000003"),
            ],
            transfer: false,
            expiration_block: 0,
        }
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let seed = B256::repeat_byte(0x42);
        let sender = Address::repeat_byte(0x07);
        let a = Agreement::derive(seed, sender, &plan(), &contracts());
        let b = Agreement::derive(seed, sender, &plan(), &contracts());
        assert_eq!(a, b);
        assert_eq!(a.id, agreement_id(seed, sender));
    }

    #[test]
    fn test_agreement_id_depends_on_seed_and_sender() {
        let seed = B256::repeat_byte(0x42);
        let sender = Address::repeat_byte(0x07);
        let base = agreement_id(seed, sender);
        assert_ne!(base, agreement_id(B256::repeat_byte(0x43), sender));
        assert_ne!(base, agreement_id(seed, Address::repeat_byte(0x08)));
    }

    #[test]
    fn test_conditions_chain_through_lock_id() {
        let seed = B256::repeat_byte(0x01);
        let sender = Address::repeat_byte(0x07);
        let plan = plan();
        let contracts = contracts();
        let agreement = Agreement::derive(seed, sender, &plan, &contracts);

        let expected_transfer = transfer_nft_hash(
            plan.did,
            plan.owner,
            sender,
            U256::from(100u64),
            agreement.lock.id,
            plan.nft_contract,
            false,
        );
        assert_eq!(agreement.transfer.value_hash, expected_transfer);
        assert_eq!(
            agreement.transfer.id,
            condition_id(agreement.id, contracts.transfer_nft_condition, expected_transfer)
        );

        let ids: Vec<_> = agreement.conditions().iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), 3);
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
    }

    #[test]
    fn test_condition_id_matches_abi_encoding() {
        let agreement = B256::repeat_byte(0xaa);
        let contract = Address::repeat_byte(0xbb);
        let value = B256::repeat_byte(0xcc);

        let mut encoded = Vec::with_capacity(96);
        encoded.extend_from_slice(agreement.as_slice());
        encoded.extend_from_slice(&[0u8; 12]);
        encoded.extend_from_slice(contract.as_slice());
        encoded.extend_from_slice(value.as_slice());

        assert_eq!(condition_id(agreement, contract, value), keccak256(encoded));
    }
}
