use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

pub const APP_NAME: &str = "LannZAi";

/// Process-wide configuration, loaded once in `main` and handed to constructors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub client: ClientConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: String,
    pub port: u16,
    pub upstream_base_url: String,
    pub model: String,
    /// Upstream credential. Usually supplied through `OPENROUTER_API_KEY`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub referer: String,
    pub title: String,
    pub idle_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8787,
            upstream_base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "nousresearch/hermes-3-llama-3.1-405b:free".to_string(),
            api_key: None,
            referer: "https://lannzai.app".to_string(),
            title: APP_NAME.to_string(),
            idle_timeout_secs: 60,
        }
    }
}

impl RelayConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// The credential, treating an empty string as absent.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("upstream_base_url", &self.upstream_base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("referer", &self.referer)
            .field("title", &self.title)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub relay_url: String,
    /// Bearer token sent to the relay (the backend's anon key in hosted setups).
    #[serde(skip_serializing)]
    pub relay_token: Option<String>,
    pub stream_responses: bool,
    pub idle_timeout_secs: u64,
    pub history_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://127.0.0.1:8787/chat".to_string(),
            relay_token: None,
            stream_responses: true,
            idle_timeout_secs: 60,
            history_limit: 20,
        }
    }
}

impl ClientConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("relay_url", &self.relay_url)
            .field("relay_token", &self.relay_token.as_ref().map(|_| "***"))
            .field("stream_responses", &self.stream_responses)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("history_limit", &self.history_limit)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Rest,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Overrides the default `$XDG_DATA_HOME/lannzai/lannzai.db`.
    pub sqlite_path: Option<PathBuf>,
    pub rest_url: Option<String>,
    #[serde(skip_serializing)]
    pub rest_key: Option<String>,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("backend", &self.backend)
            .field("sqlite_path", &self.sqlite_path)
            .field("rest_url", &self.rest_url)
            .field("rest_key", &self.rest_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Environment values win over file values.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENROUTER_API_KEY") {
            self.relay.api_key = Some(key);
        }
        if let Some(url) = lookup("LANNZAI_RELAY_URL") {
            self.client.relay_url = url;
        }
        if let Some(token) = lookup("LANNZAI_RELAY_TOKEN") {
            self.client.relay_token = Some(token);
        }
        if let Some(url) = lookup("SUPABASE_URL") {
            self.storage.rest_url = Some(url);
        }
        if let Some(key) = lookup("SUPABASE_ANON_KEY") {
            self.storage.rest_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.relay.upstream_base_url).with_context(|| {
            format!("Invalid upstream_base_url: {}", self.relay.upstream_base_url)
        })?;
        Url::parse(&self.client.relay_url)
            .with_context(|| format!("Invalid relay_url: {}", self.client.relay_url))?;

        if self.storage.backend == StorageBackend::Rest {
            let Some(rest_url) = &self.storage.rest_url else {
                bail!("storage.rest_url (or SUPABASE_URL) is required for the rest backend");
            };
            Url::parse(rest_url).with_context(|| format!("Invalid rest_url: {}", rest_url))?;
        }

        if self.client.history_limit == 0 {
            bail!("client.history_limit must be at least 1");
        }
        if self.relay.idle_timeout_secs == 0 {
            bail!("relay.idle_timeout_secs must be at least 1");
        }
        if self.client.idle_timeout_secs == 0 {
            bail!("client.idle_timeout_secs must be at least 1");
        }

        Ok(())
    }
}
