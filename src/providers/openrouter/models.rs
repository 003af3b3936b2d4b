use serde::{Deserialize, Serialize};

use crate::providers::types::ChatMessage;

// --- Request types ---

#[derive(Debug, Serialize)]
pub struct OpenRouterRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
}

// --- Response types (non-streaming) ---

#[derive(Debug, Deserialize)]
pub struct OpenRouterResponse {
    #[serde(default)]
    pub choices: Vec<OpenRouterChoice>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenRouterChoice {
    pub message: OpenRouterMessage,
}

#[derive(Debug, Deserialize)]
pub struct OpenRouterMessage {
    pub content: Option<String>,
}

// --- Streaming types ---

#[derive(Debug, Deserialize)]
pub struct OpenRouterStreamChunk {
    #[serde(default)]
    pub choices: Vec<OpenRouterStreamChoice>,
}

#[derive(Debug, Deserialize)]
pub struct OpenRouterStreamChoice {
    #[serde(default)]
    pub delta: Option<OpenRouterDelta>,
}

#[derive(Debug, Deserialize)]
pub struct OpenRouterDelta {
    pub content: Option<String>,
}

impl OpenRouterStreamChunk {
    /// The incremental text carried by `choices[0].delta.content`.
    pub fn into_content(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
    }
}
