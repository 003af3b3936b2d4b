use async_trait::async_trait;

use super::types::{ChatRequest, ChatResponse, ProviderError, UpstreamStream};

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Resolves once the provider has accepted the request; the returned
    /// stream yields the undecoded event-stream body.
    async fn open_stream(&self, request: ChatRequest) -> Result<UpstreamStream, ProviderError>;
}
