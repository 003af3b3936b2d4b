pub mod chat;
pub mod database;
pub mod export;
pub mod markdown;
pub mod remote;
pub mod store;
pub mod templates;
pub mod transport;

pub use chat::{ChatController, ChatView, StreamPhase};
pub use database::Database;
pub use remote::RestChatStore;
pub use store::ChatStore;
pub use templates::TemplateService;
pub use transport::HttpRelayClient;
