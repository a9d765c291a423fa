use thiserror::Error;

/// Failures while acquiring or using identity provider tokens.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("No identity source is configured: {0}")]
    CredentialUnavailable(String),

    #[error("Authorization grant rejected: {0}")]
    InvalidGrant(String),

    #[error("User assertion has expired")]
    AssertionExpired,

    #[error("Delegation to {scope} was denied: {detail}")]
    DelegationDenied { scope: String, detail: String },

    #[error("No cached account available for silent token acquisition")]
    NoCachedAccount,

    #[error("Identity provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Malformed identity provider response: {0}")]
    MalformedResponse(String),
}

/// Failures of a single completion call. None of these are retried internally.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Completion API rejected the credentials: {0}")]
    AuthRejected(String),

    #[error("Malformed completion response: {0}")]
    MalformedResponse(String),

    #[error("Completion cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("Message {0} is not part of the conversation")]
    UnknownMessage(u64),

    #[error("No image-bearing user message at the expected position")]
    NoImageAtPosition,

    #[error("Message {0} is not the most recent message")]
    NotLatest(u64),
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Unable to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Unable to encode image: {0}")]
    Encode(#[source] image::ImageError),
}

/// Failure of one chat turn.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("Model {0} does not accept images")]
    ImageNotSupported(String),
}
