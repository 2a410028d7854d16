//! Common re-usable types for describing Mech requests and their payments.

mod amount;
mod delivery;
mod ids;
mod payment;
mod request;

pub use amount::*;
pub use delivery::*;
pub use ids::*;
pub use payment::*;
pub use request::*;
