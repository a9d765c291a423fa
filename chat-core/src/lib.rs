//! chat-core: identity brokering, conversation state and completion plumbing
//! shared by the chat front-end.
pub mod auth;
pub mod chat;
pub mod completion;
pub mod config;
pub mod conversation;
pub mod error;
pub mod media;
pub mod models;
pub mod observability;

pub use chat::{ChatService, ChatSession, TurnReport, TurnRequest};
pub use error::{AuthError, ChatError, CompletionError, ConversationError, MediaError};
