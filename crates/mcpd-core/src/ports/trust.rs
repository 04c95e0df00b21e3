//! Trust prompting port.

use async_trait::async_trait;

use crate::domain::CollectionId;

/// Asks the user whether servers from a collection may start.
///
/// Returns `Some(true)` to trust, `Some(false)` to decline (remembered),
/// `None` when the user dismissed the prompt (asked again next time).
#[async_trait]
pub trait TrustPrompt: Send + Sync {
    async fn request_trust(&self, collection_id: &CollectionId, label: &str) -> Option<bool>;
}

/// Prompt that grants trust unconditionally; for tests and automation.
#[derive(Debug, Default)]
pub struct AlwaysTrust;

#[async_trait]
impl TrustPrompt for AlwaysTrust {
    async fn request_trust(&self, _collection_id: &CollectionId, _label: &str) -> Option<bool> {
        Some(true)
    }
}
