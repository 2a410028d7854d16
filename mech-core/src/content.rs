//! Content-addressed storage for request metadata.
//!
//! Only the resulting [`ContentId`] reaches the ledger; how bytes are stored is up to the
//! implementation.

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::types::ContentId;

/// Upload and download of documents by content identifier.
pub trait ContentStore {
    type Error: std::error::Error;

    fn upload(&self, bytes: Vec<u8>) -> impl Future<Output = Result<ContentId, Self::Error>>;

    fn download(&self, id: &ContentId) -> impl Future<Output = Result<Vec<u8>, Self::Error>>;
}

/// The metadata document a mech reads for one request.
#[derive(Builder, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[builder(into)]
    pub prompt: String,
    #[builder(into)]
    pub tool: String,
    /// Makes otherwise identical requests hash to different content ids.
    #[builder(into)]
    pub nonce: String,
}

impl RequestMetadata {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
