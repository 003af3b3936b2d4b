use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::{Message, Role};

pub const DEFAULT_TITLE: &str = "New Chat";
const TITLE_MAX_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// Removes the trailing message only when it is an assistant turn.
    pub fn pop_last_assistant(&mut self) -> Option<Message> {
        match self.messages.last() {
            Some(last) if last.role == Role::Assistant => self.messages.pop(),
            _ => None,
        }
    }

    pub fn last_role(&self) -> Option<Role> {
        self.messages.last().map(|m| m.role)
    }

    /// Title shown in history: the first user message cut to 50 characters.
    pub fn derive_title(&self) -> String {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| truncate_title(&m.content))
            .unwrap_or_else(|| DEFAULT_TITLE.to_string())
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// Partial update applied by `ChatStore::update`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
}

impl ConversationPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            messages: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.messages.is_none()
    }
}

pub fn truncate_title(text: &str) -> String {
    text.chars().take(TITLE_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_from_first_user_message() {
        let mut conv = Conversation::new();
        assert_eq!(conv.derive_title(), "New Chat");

        conv.push(Message::user("Hello"));
        conv.push(Message::assistant("Hi there!"));
        conv.push(Message::user("Second question"));
        assert_eq!(conv.derive_title(), "Hello");
    }

    #[test]
    fn test_title_truncates_on_char_boundary() {
        let long = "é".repeat(60);
        let title = truncate_title(&long);
        assert_eq!(title.chars().count(), 50);
        assert_eq!(truncate_title("short"), "short");
    }

    #[test]
    fn test_pop_last_assistant_only_removes_assistant() {
        let mut conv = Conversation::new();
        conv.push(Message::user("Hi"));
        assert!(conv.pop_last_assistant().is_none());
        assert_eq!(conv.messages.len(), 1);

        conv.push(Message::assistant("Hello!"));
        let popped = conv.pop_last_assistant().unwrap();
        assert_eq!(popped.content, "Hello!");
        assert_eq!(conv.last_role(), Some(Role::User));
    }

    #[test]
    fn test_new_conversations_get_distinct_ids() {
        assert_ne!(Conversation::new().id, Conversation::new().id);
    }
}
