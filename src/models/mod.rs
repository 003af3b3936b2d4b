pub mod conversation;
pub mod message;
pub mod template;

pub use conversation::{Conversation, ConversationPatch};
pub use message::{Message, Role};
pub use template::Template;
