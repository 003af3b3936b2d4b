use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{header, Client};
use url::Url;

use super::chat::{ByteStream, ChatError, RelayTransport};
use crate::config::ClientConfig;
use crate::relay::{RelayReply, RelayRequest};

/// Talks to the relay's `/chat` endpoint over HTTP.
pub struct HttpRelayClient {
    client: Client,
    url: Url,
    token: Option<String>,
}

impl HttpRelayClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let url = Url::parse(&config.relay_url)
            .with_context(|| format!("Invalid relay URL: {}", config.relay_url))?;
        Ok(Self {
            client: Client::new(),
            url,
            token: config.relay_token.clone().filter(|t| !t.trim().is_empty()),
        })
    }

    async fn post(
        &self,
        request: &RelayRequest,
        accept: &str,
    ) -> Result<reqwest::Response, ChatError> {
        let mut builder = self
            .client
            .post(self.url.clone())
            .header(header::ACCEPT, accept)
            .json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Relay { status, body });
        }

        Ok(response)
    }
}

#[async_trait]
impl RelayTransport for HttpRelayClient {
    async fn open_stream(&self, request: &RelayRequest) -> Result<ByteStream, ChatError> {
        let response = self.post(request, "text/event-stream").await?;
        let stream = response
            .bytes_stream()
            .map_err(|e| ChatError::Network(format!("Stream error: {}", e)));
        Ok(stream.boxed())
    }

    async fn complete(&self, request: &RelayRequest) -> Result<RelayReply, ChatError> {
        let response = self.post(request, "application/json").await?;
        response
            .json()
            .await
            .map_err(|e| ChatError::InvalidResponse(e.to_string()))
    }
}
