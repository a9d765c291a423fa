pub mod completion;
pub mod grant;
pub mod identity;
pub mod message;

pub use completion::{CompletionResult, Usage, APOLOGY_TEXT};
pub use grant::{AccountId, GrantOrigin, Scope, TokenGrant, UserAssertion};
pub use identity::{RequestMetadata, SecurityContext, UserProfile};
pub use message::{DetailLevel, ImageRef, Message, MessageContent, MessageId, Role, TranscriptEntry};
