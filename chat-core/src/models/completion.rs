use serde::{Deserialize, Serialize};

/// Text substituted when the model produced nothing.
pub const APOLOGY_TEXT: &str = "Sorry, I was unable to generate a response.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Normalized outcome of one completion call, identical for batch and streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionResult {
    text: String,
    #[serde(flatten)]
    usage: Usage,
}

impl CompletionResult {
    pub fn new(text: impl Into<String>, usage: Usage) -> Self {
        Self {
            text: text.into(),
            usage,
        }
    }

    pub fn apology() -> Self {
        Self::new(APOLOGY_TEXT, Usage::default())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn prompt_tokens(&self) -> u32 {
        self.usage.prompt_tokens
    }

    pub fn completion_tokens(&self) -> u32 {
        self.usage.completion_tokens
    }

    pub fn total_tokens(&self) -> u32 {
        self.usage.total_tokens
    }
}
