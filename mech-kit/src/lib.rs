//! # Mech Kit
//!
//! Transaction orchestration for the Mech marketplace: paying for requests, submitting them
//! directly or through a proxy wallet, waiting for their deliveries and purchasing
//! subscription plans.
//!
//! Chain access goes through the [`LedgerGateway`](mech_core::ledger::LedgerGateway) seam
//! from `mech-core`; nothing in this crate talks to a node except [`rpc`].
//!
//! ## Components
//!
//! - **[`orchestrator`]**: the entry point. Submits requests, awaits deliveries and buys
//!   subscriptions.
//! - **[`payment`]**: native, fungible-token and subscription payment strategies.
//! - **[`execution`]**: direct-key and proxy-wallet execution, and which address pays.
//! - **[`watcher`]**: the cancellable, deadline-bounded delivery watcher.
//! - **[`subscription`]**: agreement and condition id derivation, and the four-step
//!   purchase workflow.
//! - **[`receipt`]** and **[`retry`]**: waiting for receipts and the single read retry.
//! - **[`config`]**: layered configuration and chain presets.
//! - **[`metadata`]**: publishing request metadata to a content store.
//! - **[`contracts`]**: ABI bindings.
//! - **[`mock`]**: in-memory ledger, content store and descriptor source.
//! - **[`rpc`]** (feature `rpc`): JSON-RPC ledger gateway and HTTP descriptor source.
//!
//! ## Custom chains
//!
//! Presets are plain types; declare your own anywhere:
//!
//! ```
//! use alloy_primitives::address;
//! use mech_kit::config::{ChainPreset, ExplicitChain};
//!
//! struct MyChain;
//!
//! impl ExplicitChain for MyChain {
//!     const PRESET: ChainPreset = ChainPreset {
//!         name: "my-chain",
//!         chain_id: 12345,
//!         rpc_url: "https://rpc.my-chain.example",
//!         marketplace: address!("0x1111111111111111111111111111111111111111"),
//!     };
//! }
//! ```

pub mod config;
pub mod contracts;
pub mod execution;
pub mod metadata;
pub mod mock;
pub mod orchestrator;
pub mod payment;
pub mod receipt;
pub mod retry;
pub mod subscription;
pub mod watcher;

#[cfg(feature = "rpc")]
pub mod rpc;
