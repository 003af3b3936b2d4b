use serde::{Deserialize, Serialize};

use crate::models::{Conversation, Message};

/// Body of `POST /chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

impl RelayRequest {
    pub fn for_conversation(conversation: &Conversation, stream: bool) -> Self {
        Self {
            messages: conversation.messages.clone(),
            chat_id: Some(conversation.id.clone()),
            stream,
        }
    }
}

/// Non-streaming reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayReply {
    pub reply: String,
    #[serde(default)]
    pub chat_id: Option<String>,
}

/// Payload of each normalized stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentEvent {
    pub content: String,
}
