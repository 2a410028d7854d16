use alloy_primitives::{Address, TxHash};
use serde::{Deserialize, Serialize};

use crate::types::{ContentId, PaymentModel, RequestId};

/// A request accepted by the marketplace.
///
/// Built once the request transaction is mined and its request id is known; it does not
/// change afterwards. The delivery is tracked separately in a
/// [`DeliveryRecord`](crate::types::DeliveryRecord).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// The mech the request was routed to first.
    pub priority_target: Address,
    /// Tool the mech is asked to run.
    pub tool_id: String,
    /// Content identifier of the uploaded request metadata.
    pub prompt_ref: ContentId,
    /// Payment model read from the mech when the request was prepared.
    pub payment_model: PaymentModel,
    /// Identifier assigned by the marketplace.
    pub request_id: RequestId,
    /// Hash of the transaction that carried the request.
    pub tx_hash: Option<TxHash>,
}

/// Result of submitting one request transaction, which may carry a batch of requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
    pub requests: Vec<Request>,
}

impl Submission {
    pub fn request_ids(&self) -> Vec<RequestId> {
        self.requests.iter().map(|r| r.request_id).collect()
    }
}
