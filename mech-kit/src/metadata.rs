//! Publishing request metadata to a content store.

use mech_core::{
    content::{ContentStore, RequestMetadata},
    types::ContentId,
};

#[derive(Debug, thiserror::Error)]
pub enum PublishError<E: std::error::Error> {
    #[error("{tools} tools for {prompts} prompts")]
    Mismatch { tools: usize, prompts: usize },
    #[error("Failed to encode metadata: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Content store error: {0}")]
    Store(E),
}

/// Upload one metadata document per `(tool, prompt)` pair and return their content ids in
/// the same order.
///
/// Each document carries a random nonce, so publishing the same prompt twice yields two
/// distinct requests.
pub async fn publish_metadata<C: ContentStore>(
    store: &C,
    tools: &[String],
    prompts: &[String],
) -> Result<Vec<ContentId>, PublishError<C::Error>> {
    if tools.len() != prompts.len() {
        return Err(PublishError::Mismatch {
            tools: tools.len(),
            prompts: prompts.len(),
        });
    }

    let mut ids = Vec::with_capacity(prompts.len());
    for (tool, prompt) in tools.iter().zip(prompts) {
        let metadata = RequestMetadata::builder()
            .prompt(prompt.as_str())
            .tool(tool.as_str())
            .nonce(hex::encode(rand::random::<[u8; 16]>()))
            .build();
        let id = store
            .upload(metadata.to_bytes()?)
            .await
            .map_err(PublishError::Store)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(%tool, content_id = %id, "Published request metadata");

        ids.push(id);
    }
    Ok(ids)
}
