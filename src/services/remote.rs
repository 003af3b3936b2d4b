use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use url::Url;

use super::store::ChatStore;
use crate::models::{Conversation, ConversationPatch};

const CHATS_PATH: &str = "rest/v1/chats";

/// Row-oriented backend speaking the PostgREST dialect (`chats` table).
pub struct RestChatStore {
    client: Client,
    table_url: Url,
    api_key: Option<String>,
}

impl RestChatStore {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .with_context(|| format!("Invalid storage URL: {}", base_url))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let table_url = base
            .join(CHATS_PATH)
            .context("Failed to build chats table URL")?;

        Ok(Self {
            client: Client::new(),
            table_url,
            api_key,
        })
    }

    fn list_url(&self, limit: usize) -> Url {
        let mut url = self.table_url.clone();
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair("order", "updated_at.desc")
            .append_pair("limit", &limit.to_string());
        url
    }

    fn row_url(&self, id: &str) -> Url {
        let mut url = self.table_url.clone();
        url.query_pairs_mut().append_pair("id", &format!("eq.{}", id));
        url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request
                .header("apikey", key)
                .header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, action: &str) -> Result<reqwest::Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .with_context(|| format!("Failed to {} chat", action))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Failed to {} chat: HTTP {}: {}", action, status.as_u16(), body);
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatStore for RestChatStore {
    async fn upsert(&self, conversation: &Conversation) -> Result<()> {
        let request = self
            .client
            .post(self.table_url.clone())
            .header("Prefer", "resolution=merge-duplicates")
            .json(conversation);
        self.send(request, "save").await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        let mut url = self.row_url(id);
        url.query_pairs_mut().append_pair("select", "*");
        let response = self.send(self.client.get(url), "load").await?;
        let rows: Vec<Conversation> = response
            .json()
            .await
            .context("Chat rows have an unexpected shape")?;
        Ok(rows.into_iter().next())
    }

    async fn list(&self, limit: usize) -> Result<Vec<Conversation>> {
        let request = self.client.get(self.list_url(limit));
        let response = self.send(request, "list").await?;
        response
            .json()
            .await
            .context("Chat rows have an unexpected shape")
    }

    async fn update(&self, id: &str, patch: ConversationPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let request = self.client.patch(self.row_url(id)).json(&patch);
        self.send(request, "update").await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let request = self.client.delete(self.row_url(id));
        self.send(request, "delete").await?;
        Ok(())
    }
}
