//! Scripted backend for tests and offline runs.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{CompletionBackend, CompletionRequest, DeltaStream, StreamAccumulator, StreamChunk};
use crate::error::CompletionError;
use crate::models::{CompletionResult, Role, TokenGrant, Usage};

enum Script {
    Fixed(Vec<StreamChunk>),
    /// Answers with the last user prompt.
    Echo,
    Fail(CompletionError),
}

/// Batch answers are folded from the same chunks a stream would yield.
pub struct MockCompletionBackend {
    script: Script,
    chunk_delay: Option<Duration>,
    calls: AtomicUsize,
    last_request: Mutex<Option<CompletionRequest>>,
}

impl MockCompletionBackend {
    pub fn scripted(chunks: Vec<StreamChunk>) -> Self {
        Self::with_script(Script::Fixed(chunks))
    }

    pub fn echo() -> Self {
        Self::with_script(Script::Echo)
    }

    pub fn failing(error: CompletionError) -> Self {
        Self::with_script(Script::Fail(error))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            chunk_delay: None,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Sleep before every streamed chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.last_request.lock().ok().and_then(|r| r.clone())
    }

    fn record(&self, request: &CompletionRequest) -> Result<Vec<StreamChunk>, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_request.lock() {
            *last = Some(request.clone());
        }

        match &self.script {
            Script::Fixed(chunks) => Ok(chunks.clone()),
            Script::Echo => Ok(echo_chunks(request)),
            Script::Fail(error) => Err(error.clone()),
        }
    }
}

fn echo_chunks(request: &CompletionRequest) -> Vec<StreamChunk> {
    let prompt = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role() == Role::User)
        .map(|m| m.content().text().to_string())
        .unwrap_or_default();

    let prompt_tokens = request
        .messages
        .iter()
        .map(|m| m.content().text().len() as u32 / 4)
        .sum::<u32>()
        .max(1);

    vec![
        StreamChunk::text("Mock"),
        StreamChunk::text(" response"),
        StreamChunk::text(" for: "),
        StreamChunk::text(prompt),
        StreamChunk::usage_only(Usage {
            prompt_tokens,
            completion_tokens: 5,
            total_tokens: prompt_tokens + 5,
        }),
    ]
}

#[async_trait]
impl CompletionBackend for MockCompletionBackend {
    async fn complete(
        &self,
        _grant: &TokenGrant,
        request: &CompletionRequest,
    ) -> Result<CompletionResult, CompletionError> {
        let chunks = self.record(request)?;

        let mut acc = StreamAccumulator::new();
        for chunk in chunks {
            acc.push(chunk);
        }
        if acc.text().is_empty() {
            return Ok(CompletionResult::apology());
        }
        Ok(acc.finish())
    }

    async fn stream(
        &self,
        _grant: &TokenGrant,
        request: &CompletionRequest,
    ) -> Result<DeltaStream, CompletionError> {
        let chunks = self.record(request)?;
        let items = tokio_stream::iter(chunks.into_iter().map(Ok::<StreamChunk, CompletionError>));

        match self.chunk_delay {
            Some(delay) => Ok(Box::pin(items.then(move |chunk| async move {
                tokio::time::sleep(delay).await;
                chunk
            })) as DeltaStream),
            None => Ok(Box::pin(items) as DeltaStream),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
