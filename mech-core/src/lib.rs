//! Mech core library.
//!
//! Types and collaborator interfaces shared by everything that pays for Mech marketplace
//! requests and waits for their deliveries.
//!
//! - [`types`]: identifiers, payment models, request and delivery records.
//! - [`ledger`]: the [`LedgerGateway`](ledger::LedgerGateway) seam and its wire types.
//! - [`content`]: content-addressed storage of request metadata.
//! - [`descriptor`]: subscription plan descriptors and where they come from.
//! - [`errors`]: the error taxonomy, tagged with the stage that failed.

pub mod content;
pub mod descriptor;
pub mod errors;
pub mod ledger;
pub mod types;
