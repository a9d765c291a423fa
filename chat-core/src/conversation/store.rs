use std::future::Future;

use crate::error::ConversationError;
use crate::models::{
    CompletionResult, ImageRef, Message, MessageContent, MessageId, Role, TranscriptEntry,
};

/// Compaction runs once the log holds more than this many messages.
pub const COMPACTION_THRESHOLD: usize = 7;

pub const SUMMARY_INSTRUCTION: &str =
    "Summarize the conversation you've had with the user. Ensure you keep the most important points.";

/// Ordered message log of one chat session.
///
/// The first message is always the system prompt.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    messages: Vec<Message>,
    next_id: u64,
}

impl ConversationStore {
    pub fn new(system_prompt: &str, greeting: &str) -> Self {
        let mut store = Self {
            messages: Vec::new(),
            next_id: 0,
        };
        store.seed(system_prompt, greeting);
        store
    }

    /// Back to `[system, greeting]`. Ids keep increasing so stale handles
    /// never match a new message.
    pub fn reset(&mut self, system_prompt: &str, greeting: &str) {
        self.messages.clear();
        self.seed(system_prompt, greeting);
    }

    fn seed(&mut self, system_prompt: &str, greeting: &str) {
        self.push(Role::System, MessageContent::Text(system_prompt.to_string()));
        self.push(Role::Assistant, MessageContent::Text(greeting.to_string()));
    }

    fn push(&mut self, role: Role, content: MessageContent) -> MessageId {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        self.messages.push(Message::new(id, role, content));
        id
    }

    pub fn append_user(&mut self, text: &str, image: Option<ImageRef>) -> MessageId {
        let content = match image {
            Some(image) => MessageContent::TextWithImage {
                text: text.to_string(),
                image,
            },
            None => MessageContent::Text(text.to_string()),
        };
        self.push(Role::User, content)
    }

    pub fn append_assistant(&mut self, text: &str) -> MessageId {
        self.push(Role::Assistant, MessageContent::Text(text.to_string()))
    }

    /// Replace a user message's content with `original_text` alone.
    pub fn strip_image(&mut self, id: MessageId, original_text: &str) -> Result<(), ConversationError> {
        let message = self
            .messages
            .iter_mut()
            .skip(1)
            .find(|m| m.id() == id)
            .ok_or(ConversationError::UnknownMessage(id.value()))?;

        if message.role() != Role::User || !message.content().has_image() {
            return Err(ConversationError::NoImageAtPosition);
        }

        message.replace_content(MessageContent::Text(original_text.to_string()));
        Ok(())
    }

    /// Strip the image from the second-to-last message, which must be an
    /// image-bearing user message. Anything else is refused untouched.
    pub fn strip_last_image(&mut self, original_text: &str) -> Result<(), ConversationError> {
        let position = self
            .messages
            .len()
            .checked_sub(2)
            .filter(|&i| i > 0)
            .ok_or(ConversationError::NoImageAtPosition)?;

        let id = self.messages[position].id();
        self.strip_image(id, original_text)
    }

    /// Remove the most recent message, which must be `id`.
    pub fn retract(&mut self, id: MessageId) -> Result<(), ConversationError> {
        match self.messages.last() {
            Some(last) if last.id() == id && self.messages.len() > 1 => {
                self.messages.pop();
                Ok(())
            }
            Some(_) if self.messages.iter().any(|m| m.id() == id) => {
                Err(ConversationError::NotLatest(id.value()))
            }
            _ => Err(ConversationError::UnknownMessage(id.value())),
        }
    }

    pub fn needs_compaction(&self) -> bool {
        self.messages.len() > COMPACTION_THRESHOLD
    }

    /// Summarize the log once it exceeds the threshold.
    ///
    /// `complete` receives the whole log plus the summary instruction. On
    /// success the log becomes `[system, instruction, summary]`; on error it
    /// is left exactly as it was and the error is returned.
    pub async fn maybe_compact<F, Fut, E>(&mut self, complete: F) -> Result<bool, E>
    where
        F: FnOnce(Vec<Message>) -> Fut,
        Fut: Future<Output = Result<CompletionResult, E>>,
    {
        if !self.needs_compaction() {
            return Ok(false);
        }

        let mut candidate = self.messages.clone();
        let instruction = Message::new(
            MessageId(self.next_id),
            Role::User,
            MessageContent::Text(SUMMARY_INSTRUCTION.to_string()),
        );
        candidate.push(instruction.clone());

        let summary = complete(candidate).await?;

        let system = self.messages[0].clone();
        self.next_id += 1;
        let summary_id = MessageId(self.next_id);
        self.next_id += 1;

        self.messages = vec![
            system,
            instruction,
            Message::new(
                summary_id,
                Role::Assistant,
                MessageContent::Text(summary.text().to_string()),
            ),
        ];

        tracing::info!(
            prompt_tokens = summary.prompt_tokens(),
            completion_tokens = summary.completion_tokens(),
            "Conversation compacted"
        );
        Ok(true)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Display view: everything but the system prompt, text only.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.messages
            .iter()
            .filter(|m| m.role() != Role::System)
            .map(|m| TranscriptEntry {
                id: m.id(),
                role: m.role(),
                text: m.content().text().to_string(),
                had_image: m.content().has_image(),
            })
            .collect()
    }
}
