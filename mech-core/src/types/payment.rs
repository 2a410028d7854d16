use std::fmt::Display;

use alloy_primitives::{B256, b256};
use serde::{Deserialize, Serialize};

/// How a mech is paid, as recorded against the mech on-chain.
///
/// The model is read from the mech when a request is prepared and never supplied by the
/// caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentModel {
    /// Paid in the chain's native asset, attached as transaction value.
    Native,
    /// Paid in an ERC-20 token pulled by the marketplace's balance tracker.
    FungibleToken,
    /// Prepaid subscription purchased with the native asset.
    SubscriptionNative,
    /// Prepaid subscription purchased with an ERC-20 token.
    SubscriptionToken,
}

impl PaymentModel {
    pub const ALL: [PaymentModel; 4] = [
        PaymentModel::Native,
        PaymentModel::FungibleToken,
        PaymentModel::SubscriptionNative,
        PaymentModel::SubscriptionToken,
    ];

    /// The marketplace's `bytes32` payment type for this model.
    pub fn tag(self) -> B256 {
        match self {
            PaymentModel::Native => {
                b256!("0xba699a34be8fe0e7725e93dcbce1701b0211a8ca61330aaeb8a05bf2ec7abed1")
            }
            PaymentModel::FungibleToken => {
                b256!("0x3679d66ef546e66ce9057c4a052f317b135bc8e8c509638f7966edfd4fcf45e9")
            }
            PaymentModel::SubscriptionNative => {
                b256!("0x803dd08fe79d91027fc9024e254a0942372b92f3ccabc1bd19f4a5c2b251c316")
            }
            PaymentModel::SubscriptionToken => {
                b256!("0x0d6fd99afa9c4c580fab5e341922c2a5c4b61d880da60506193d7bf88944dd14")
            }
        }
    }

    pub fn from_tag(tag: B256) -> Option<Self> {
        Self::ALL.into_iter().find(|model| model.tag() == tag)
    }

    pub fn is_subscription(self) -> bool {
        matches!(
            self,
            PaymentModel::SubscriptionNative | PaymentModel::SubscriptionToken
        )
    }
}

impl Display for PaymentModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PaymentModel::Native => "native",
            PaymentModel::FungibleToken => "token",
            PaymentModel::SubscriptionNative => "native-subscription",
            PaymentModel::SubscriptionToken => "token-subscription",
        };
        f.write_str(name)
    }
}
