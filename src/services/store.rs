use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Conversation, ConversationPatch};

/// Remote or local home of saved conversations.
///
/// Writes are whole-document: `upsert` replaces the stored row for the
/// conversation id, so concurrent writers resolve by last write wins.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn upsert(&self, conversation: &Conversation) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Conversation>>;

    /// Most recently updated first.
    async fn list(&self, limit: usize) -> Result<Vec<Conversation>>;

    async fn update(&self, id: &str, patch: ConversationPatch) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
impl<S: ChatStore + ?Sized> ChatStore for Arc<S> {
    async fn upsert(&self, conversation: &Conversation) -> Result<()> {
        (**self).upsert(conversation).await
    }

    async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        (**self).get(id).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<Conversation>> {
        (**self).list(limit).await
    }

    async fn update(&self, id: &str, patch: ConversationPatch) -> Result<()> {
        (**self).update(id, patch).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        (**self).delete(id).await
    }
}
