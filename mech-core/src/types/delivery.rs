use std::collections::BTreeMap;

use alloy_primitives::{Address, Bytes, TxHash};
use serde::{Deserialize, Serialize};

use crate::types::{ContentId, RequestId};

/// What a mech posted back for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    /// The mech that actually delivered, which may differ from the priority mech.
    pub delivery_mech: Address,
    /// Raw delivered data as emitted on-chain.
    pub data: Bytes,
    /// The delivered data read as a content identifier, when it is a 32-byte digest.
    pub content_id: Option<ContentId>,
    /// Transaction that carried the delivery, when the ledger reports it.
    pub tx_hash: Option<TxHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status", content = "payload")]
pub enum DeliveryStatus {
    Pending,
    Delivered(DeliveryPayload),
}

impl DeliveryStatus {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered(_))
    }

    pub fn payload(&self) -> Option<&DeliveryPayload> {
        match self {
            DeliveryStatus::Delivered(p) => Some(p),
            DeliveryStatus::Pending => None,
        }
    }
}

/// Delivery state for a fixed set of request ids.
///
/// Entries only ever move from pending to delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    entries: BTreeMap<RequestId, DeliveryStatus>,
}

impl DeliveryRecord {
    pub fn pending(ids: impl IntoIterator<Item = RequestId>) -> Self {
        DeliveryRecord {
            entries: ids
                .into_iter()
                .map(|id| (id, DeliveryStatus::Pending))
                .collect(),
        }
    }

    /// Mark `id` delivered. Returns `false` if the id is unknown or already delivered.
    pub fn resolve(&mut self, id: RequestId, payload: DeliveryPayload) -> bool {
        match self.entries.get_mut(&id) {
            Some(status) if !status.is_delivered() => {
                *status = DeliveryStatus::Delivered(payload);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &RequestId) -> Option<&DeliveryStatus> {
        self.entries.get(id)
    }

    pub fn outstanding(&self) -> Vec<RequestId> {
        self.entries
            .iter()
            .filter(|(_, status)| !status.is_delivered())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn delivered(&self) -> impl Iterator<Item = (&RequestId, &DeliveryPayload)> {
        self.entries
            .iter()
            .filter_map(|(id, status)| status.payload().map(|p| (id, p)))
    }

    pub fn is_complete(&self) -> bool {
        self.entries.values().all(DeliveryStatus::is_delivered)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
