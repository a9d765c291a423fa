use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Vision detail requested for an attached image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    #[default]
    Low,
    High,
}

/// Base64 PNG attached to exactly one user turn.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageRef {
    encoded: String,
    detail: DetailLevel,
}

impl ImageRef {
    pub fn new(encoded: impl Into<String>, detail: DetailLevel) -> Self {
        Self {
            encoded: encoded.into(),
            detail,
        }
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    pub fn detail(&self) -> DetailLevel {
        self.detail
    }

    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.encoded)
    }
}

// Payloads run to megabytes; keep them out of logs.
impl fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRef")
            .field("encoded_len", &self.encoded.len())
            .field("detail", &self.detail)
            .finish()
    }
}

/// Handle returned by the conversation store when a message is appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MessageId(pub(crate) u64);

impl MessageId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    TextWithImage { text: String, image: ImageRef },
}

impl MessageContent {
    pub fn text(&self) -> &str {
        match self {
            MessageContent::Text(text) => text,
            MessageContent::TextWithImage { text, .. } => text,
        }
    }

    pub fn image(&self) -> Option<&ImageRef> {
        match self {
            MessageContent::Text(_) => None,
            MessageContent::TextWithImage { image, .. } => Some(image),
        }
    }

    pub fn has_image(&self) -> bool {
        self.image().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    role: Role,
    content: MessageContent,
}

impl Message {
    pub(crate) fn new(id: MessageId, role: Role, content: MessageContent) -> Self {
        Self { id, role, content }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &MessageContent {
        &self.content
    }

    pub(crate) fn replace_content(&mut self, content: MessageContent) {
        self.content = content;
    }
}

/// What a user gets to see of a message: role and text, never the image payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
    pub had_image: bool,
}
