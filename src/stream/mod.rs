//! Server-sent-event plumbing shared by the relay and the chat client.

pub mod decoder;
pub mod lines;

pub use decoder::{DecodedEvent, StreamDecoder};
pub use lines::{data_payload, LineBuffer};

/// Payload of the terminal event.
pub const DONE_SENTINEL: &str = "[DONE]";
