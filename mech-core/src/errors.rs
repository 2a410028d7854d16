//! Error taxonomy for paying for requests and purchasing subscriptions.
//!
//! Every failure raised inside a flow names the [`Stage`] it happened in, so a caller can
//! tell an approval revert from a request revert, or the agreement step from the
//! fulfillment step.

use std::fmt::Display;

use alloy_primitives::{Address, B256, TxHash, U256};

use crate::{descriptor::DescriptorError, types::Did};

/// Which payment strategy was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentKind {
    Native,
    FungibleToken,
    SubscriptionCheck,
}

/// The four steps of a subscription purchase, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionStep {
    BalanceCheck,
    TokenApproval,
    AgreementCreation,
    AgreementFulfillment,
}

/// Where in a flow an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Payment(PaymentKind),
    Request,
    Delivery,
    Subscription(SubscriptionStep),
}

impl Display for PaymentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PaymentKind::Native => "native payment",
            PaymentKind::FungibleToken => "token payment",
            PaymentKind::SubscriptionCheck => "subscription check",
        })
    }
}

impl Display for SubscriptionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SubscriptionStep::BalanceCheck => "balance check",
            SubscriptionStep::TokenApproval => "token approval",
            SubscriptionStep::AgreementCreation => "agreement creation",
            SubscriptionStep::AgreementFulfillment => "agreement fulfillment",
        })
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Payment(kind) => write!(f, "{kind}"),
            Stage::Request => f.write_str("request submission"),
            Stage::Delivery => f.write_str("delivery watch"),
            Stage::Subscription(step) => write!(f, "subscription {step}"),
        }
    }
}

/// The three conditions of a subscription agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionKind {
    Lock,
    Transfer,
    Escrow,
}

impl Display for ConditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConditionKind::Lock => "lock payment",
            ConditionKind::Transfer => "transfer",
            ConditionKind::Escrow => "escrow payment",
        })
    }
}

/// Failures reported by a [`LedgerGateway`](crate::ledger::LedgerGateway).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The node could not be reached or the connection dropped. Retryable for reads.
    #[error("transport error: {0}")]
    Transport(String),

    /// The node answered with a JSON-RPC error.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The node refused the transaction before it got a hash.
    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// The key could not produce a signature.
    #[error("signing failed: {0}")]
    Signing(String),

    /// Returned data did not match the expected ABI.
    #[error("decode error: {0}")]
    Decode(String),
}

impl LedgerError {
    pub fn transport(msg: impl Into<String>) -> Self {
        LedgerError::Transport(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        LedgerError::Rejected(msg.into())
    }

    pub fn signing(msg: impl Into<String>) -> Self {
        LedgerError::Signing(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        LedgerError::Decode(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transport(_))
    }
}

/// Error types for request and subscription flows.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Balance, allowance or entitlement too low. Raised before anything is submitted.
    #[error("{stage}: insufficient funds for {payer}: required {required}, available {available}")]
    Funds {
        stage: Stage,
        payer: Address,
        required: U256,
        available: U256,
    },

    /// Building, signing or sending a transaction failed before a hash was obtained.
    #[error("{stage}: submission failed: {source}")]
    Submission {
        stage: Stage,
        #[source]
        source: LedgerError,
    },

    /// The transaction was mined but reverted.
    #[error(
        "{stage}: transaction {tx_hash} reverted: {}",
        .reason.as_deref().unwrap_or("no reason given")
    )]
    OnchainRevert {
        stage: Stage,
        tx_hash: TxHash,
        reason: Option<String>,
    },

    /// A submitted transaction was not mined before the wait expired.
    #[error("{stage}: timed out waiting for transaction {tx_hash}")]
    Timeout { stage: Stage, tx_hash: TxHash },

    /// A locally derived condition id disagrees with the ledger's derivation.
    #[error("{stage}: {condition} condition id derived locally as {local}, ledger derives {onchain}")]
    DerivationMismatch {
        stage: Stage,
        condition: ConditionKind,
        local: B256,
        onchain: B256,
    },

    /// A ledger read failed (after the single retry allowed for transient failures).
    #[error("{stage}: ledger read failed: {source}")]
    Read {
        stage: Stage,
        #[source]
        source: LedgerError,
    },

    /// The plan descriptor could not be fetched or is unusable.
    #[error("{stage}: plan descriptor for {did} unavailable: {source}")]
    Descriptor {
        stage: Stage,
        did: Did,
        #[source]
        source: DescriptorError,
    },

    /// The mech reports a payment type this crate does not know.
    #[error("mech {mech} reports unknown payment type {tag}")]
    UnknownPaymentModel { mech: Address, tag: B256 },

    /// The request receipt did not carry one request id per submitted prompt.
    #[error("transaction {tx_hash} yielded {found} request ids, expected {expected}")]
    MissingRequestIds {
        tx_hash: TxHash,
        expected: usize,
        found: usize,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{stage}: cancelled")]
    Cancelled { stage: Stage },
}

impl Error {
    pub fn submission(stage: Stage, source: LedgerError) -> Self {
        Error::Submission { stage, source }
    }

    pub fn read(stage: Stage, source: LedgerError) -> Self {
        Error::Read { stage, source }
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// The stage the error was raised in, if it was raised inside a flow.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Funds { stage, .. }
            | Error::Submission { stage, .. }
            | Error::OnchainRevert { stage, .. }
            | Error::Timeout { stage, .. }
            | Error::DerivationMismatch { stage, .. }
            | Error::Read { stage, .. }
            | Error::Descriptor { stage, .. }
            | Error::Cancelled { stage } => Some(*stage),
            Error::UnknownPaymentModel { .. } => Some(Stage::Request),
            Error::MissingRequestIds { .. } => Some(Stage::Request),
            Error::InvalidInput(_) => None,
        }
    }

    /// Relabel the stage of an error raised by a helper shared between flows.
    pub fn at(self, new_stage: Stage) -> Self {
        match self {
            Error::Funds {
                payer,
                required,
                available,
                ..
            } => Error::Funds {
                stage: new_stage,
                payer,
                required,
                available,
            },
            Error::Submission { source, .. } => Error::Submission {
                stage: new_stage,
                source,
            },
            Error::OnchainRevert {
                tx_hash, reason, ..
            } => Error::OnchainRevert {
                stage: new_stage,
                tx_hash,
                reason,
            },
            Error::Timeout { tx_hash, .. } => Error::Timeout {
                stage: new_stage,
                tx_hash,
            },
            Error::DerivationMismatch {
                condition,
                local,
                onchain,
                ..
            } => Error::DerivationMismatch {
                stage: new_stage,
                condition,
                local,
                onchain,
            },
            Error::Read { source, .. } => Error::Read {
                stage: new_stage,
                source,
            },
            Error::Descriptor { did, source, .. } => Error::Descriptor {
                stage: new_stage,
                did,
                source,
            },
            Error::Cancelled { .. } => Error::Cancelled { stage: new_stage },
            other => other,
        }
    }

    /// Whether the error happened before anything reached the ledger.
    pub fn is_pre_submission(&self) -> bool {
        matches!(
            self,
            Error::Funds { .. }
                | Error::Submission { .. }
                | Error::DerivationMismatch { .. }
                | Error::InvalidInput(_)
                | Error::UnknownPaymentModel { .. }
        )
    }
}

/// A specialized `Result` type for request and subscription flows.
pub type Result<T> = std::result::Result<T, Error>;
