use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;

use super::models::*;
use crate::config::RelayConfig;
use crate::providers::traits::CompletionProvider;
use crate::providers::types::{
    ChatRequest, ChatResponse, ProviderError, UpstreamStream,
};

pub struct OpenRouterProvider {
    client: Client,
    base_url: String,
    referer: String,
    title: String,
}

impl OpenRouterProvider {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.upstream_base_url.clone(),
            referer: config.referer.clone(),
            title: config.title.clone(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn post(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = OpenRouterRequest {
            model: &request.model,
            messages: &request.messages,
            stream,
        };

        let response = self
            .client
            .post(self.completions_url())
            .header("content-type", "application/json")
            .header("Authorization", format!("Bearer {}", request.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            tracing::error!("OpenRouter error ({}): {}", status, body);
            return Err(ProviderError::Upstream { status, body });
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for OpenRouterProvider {
    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let response = self.post(&request, false).await?;

        let parsed: OpenRouterResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content);

        Ok(ChatResponse {
            content,
            model: parsed.model.unwrap_or(request.model),
        })
    }

    async fn open_stream(&self, request: ChatRequest) -> Result<UpstreamStream, ProviderError> {
        let response = self.post(&request, true).await?;

        let stream = response
            .bytes_stream()
            .map_err(|e| ProviderError::NetworkError(format!("Stream error: {}", e)));

        Ok(stream.boxed())
    }
}
