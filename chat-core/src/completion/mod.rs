//! Chat completion plumbing.
//!
//! Backends speak one wire protocol each; the gateway adds scope checks,
//! idle timeouts and cancellation on top and turns streams into the same
//! [`CompletionResult`] a batch call returns.

mod accumulator;
pub mod azure_openai;
mod gateway;
pub mod mock;

pub use accumulator::StreamAccumulator;
pub use azure_openai::AzureOpenAiBackend;
pub use gateway::CompletionGateway;
pub use mock::MockCompletionBackend;

use async_trait::async_trait;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::error::CompletionError;
use crate::models::{CompletionResult, Message, SecurityContext, TokenGrant, Usage};

/// One server-sent increment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub delta: Option<String>,
    pub usage: Option<Usage>,
}

impl StreamChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            usage: None,
        }
    }

    pub fn usage_only(usage: Usage) -> Self {
        Self {
            delta: None,
            usage: Some(usage),
        }
    }
}

/// Lazy, finite and not restartable.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, CompletionError>> + Send>>;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Deployment name.
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub security_context: Option<SecurityContext>,
}

pub enum CompletionMode {
    Batch,
    /// Deltas are forwarded to `deltas` as they arrive, if given.
    Streaming {
        deltas: Option<mpsc::Sender<String>>,
    },
}

impl CompletionMode {
    pub fn streaming_to(deltas: mpsc::Sender<String>) -> Self {
        CompletionMode::Streaming {
            deltas: Some(deltas),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CompletionMode::Batch => "batch",
            CompletionMode::Streaming { .. } => "streaming",
        }
    }
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        grant: &TokenGrant,
        request: &CompletionRequest,
    ) -> Result<CompletionResult, CompletionError>;

    async fn stream(
        &self,
        grant: &TokenGrant,
        request: &CompletionRequest,
    ) -> Result<DeltaStream, CompletionError>;

    fn name(&self) -> &'static str;
}
