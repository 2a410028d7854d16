//! Subscription plan descriptors.
//!
//! A descriptor tells the subscription workflow who sells the plan, what it costs, who gets
//! paid and which NFT represents it.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::types::{Did, TokenAmount};

/// Pricing and delivery terms of a subscription plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDescriptor {
    pub did: Did,
    /// Plan owner, holder of the subscription NFT.
    pub owner: Address,
    /// Subscription NFT contract.
    pub nft_contract: Address,
    /// Credits granted by one purchase.
    pub nft_amount: TokenAmount,
    /// Payment token; the zero address means the chain's native asset.
    #[serde(default)]
    pub token_address: Address,
    /// Amounts paid out on release, one per receiver.
    pub amounts: Vec<TokenAmount>,
    pub receivers: Vec<Address>,
    /// Whether the NFT is transferred (as opposed to minted) on fulfillment.
    #[serde(default)]
    pub transfer: bool,
    #[serde(default)]
    pub expiration_block: u64,
}

impl PlanDescriptor {
    pub fn is_native(&self) -> bool {
        self.token_address == Address::ZERO
    }

    /// Total price of one purchase: the sum of all payout amounts.
    ///
    /// Saturates on overflow; [`PlanDescriptor::validate`] rejects such plans.
    pub fn total_price(&self) -> U256 {
        self.amounts.iter().copied().sum::<TokenAmount>().0
    }

    /// The sum of all payout amounts, or `None` if it does not fit a `uint256`.
    pub fn checked_total_price(&self) -> Option<U256> {
        self.amounts
            .iter()
            .try_fold(TokenAmount::ZERO, |acc, amount| acc.checked_add(*amount))
            .map(<U256 as From<TokenAmount>>::from)
    }

    pub fn amounts_u256(&self) -> Vec<U256> {
        self.amounts.iter().map(|a| a.0).collect()
    }

    /// Check the shape the on-chain conditions expect.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.amounts.is_empty() {
            return Err(DescriptorError::invalid("plan has no payout amounts"));
        }
        if self.amounts.len() != self.receivers.len() {
            return Err(DescriptorError::invalid(format!(
                "{} amounts for {} receivers",
                self.amounts.len(),
                self.receivers.len()
            )));
        }
        if self.nft_amount.is_zero() {
            return Err(DescriptorError::invalid("plan grants zero credits"));
        }
        if self.checked_total_price().is_none() {
            return Err(DescriptorError::invalid("payout amounts overflow uint256"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    /// The source could not be reached. Retryable once.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no descriptor for {0}")]
    NotFound(Did),
    #[error("invalid descriptor: {0}")]
    Invalid(String),
}

impl DescriptorError {
    pub fn transport(msg: impl Into<String>) -> Self {
        DescriptorError::Transport(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        DescriptorError::Invalid(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DescriptorError::Transport(_))
    }
}

/// Where plan descriptors come from.
pub trait PlanDescriptorSource {
    fn fetch_descriptor(
        &self,
        did: &Did,
    ) -> impl Future<Output = Result<PlanDescriptor, DescriptorError>>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn plan_json() -> serde_json::Value {
        json!({
            "did": "did:nv:0b1c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d7e8f9a0b1c",
            "owner": "0x3CB9B3bBfde8501f411bB69Ad3DC07908ED0dE20",
            "nftContract": "0x1111111111111111111111111111111111111111",
            "nftAmount": "100",
            "tokenAddress": "0x2222222222222222222222222222222222222222",
            "amounts": ["990000", "10000"],
            "receivers": [
                "0x3CB9B3bBfde8501f411bB69Ad3DC07908ED0dE20",
                "0x4444444444444444444444444444444444444444"
            ]
        })
    }

    #[test]
    fn test_parse_and_price() {
        let plan: PlanDescriptor = serde_json::from_value(plan_json()).unwrap();
        assert!(!plan.is_native());
        assert_eq!(plan.total_price(), U256::from(1_000_000u64));
        assert!(!plan.transfer);
        assert_eq!(plan.expiration_block, 0);
        plan.validate().unwrap();
    }

    #[test]
    fn test_native_when_token_omitted() {
        let mut value = plan_json();
        value.as_object_mut().unwrap().remove("tokenAddress");
        let plan: PlanDescriptor = serde_json::from_value(value).unwrap();
        assert!(plan.is_native());
    }

    #[test]
    fn test_validate_rejects_mismatched_receivers() {
        let mut plan: PlanDescriptor = serde_json::from_value(plan_json()).unwrap();
        plan.receivers.pop();
        assert!(matches!(plan.validate(), Err(DescriptorError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_overflowing_price() {
        let mut plan: PlanDescriptor = serde_json::from_value(plan_json()).unwrap();
        plan.amounts = vec![TokenAmount(U256::MAX), TokenAmount::from(1u64)];

        assert_eq!(plan.checked_total_price(), None);
        assert!(matches!(plan.validate(), Err(DescriptorError::Invalid(msg)) if msg.contains("overflow")));
    }
}
