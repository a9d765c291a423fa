use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    AzureOpenAiBackend, CompletionBackend, CompletionMode, CompletionRequest, DeltaStream,
    MockCompletionBackend, StreamAccumulator,
};
use crate::config::{CompletionBackendKind, CompletionSettings};
use crate::error::CompletionError;
use crate::models::{CompletionResult, Scope, TokenGrant};

/// Single entry point for completion calls, batch or streaming.
#[derive(Clone)]
pub struct CompletionGateway {
    backend: Arc<dyn CompletionBackend>,
    scope: Scope,
    idle_timeout: Duration,
}

impl CompletionGateway {
    pub fn new(backend: Arc<dyn CompletionBackend>, scope: Scope, idle_timeout: Duration) -> Self {
        Self {
            backend,
            scope,
            idle_timeout,
        }
    }

    pub fn from_settings(settings: &CompletionSettings) -> Result<Self, CompletionError> {
        let backend: Arc<dyn CompletionBackend> = match settings.backend {
            CompletionBackendKind::AzureOpenai => Arc::new(AzureOpenAiBackend::new(settings)?),
            CompletionBackendKind::Mock => {
                tracing::warn!("Using the mock completion backend");
                Arc::new(MockCompletionBackend::echo())
            }
        };

        Ok(Self::new(
            backend,
            Scope::new(settings.resource_scope.clone()),
            Duration::from_secs(settings.stream_idle_timeout_secs),
        ))
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Run one completion. Fails with `AuthRejected` before any I/O when the
    /// grant was issued for another scope.
    #[tracing::instrument(
        skip_all,
        fields(backend = self.backend.name(), model = %request.model, mode = mode.label())
    )]
    pub async fn complete(
        &self,
        grant: &TokenGrant,
        request: &CompletionRequest,
        mode: CompletionMode,
        cancel: &CancellationToken,
    ) -> Result<CompletionResult, CompletionError> {
        if !grant.is_scoped_to(&self.scope) {
            tracing::error!(grant_scope = %grant.scope(), "Grant presented to the wrong audience");
            return Err(CompletionError::AuthRejected(format!(
                "grant for {} cannot call {}",
                grant.scope(),
                self.scope
            )));
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CompletionError::Cancelled),
            result = self.dispatch(grant, request, mode) => result,
        };

        match &outcome {
            Ok(result) => tracing::info!(
                prompt_tokens = result.prompt_tokens(),
                completion_tokens = result.completion_tokens(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Completion finished"
            ),
            Err(e) => tracing::warn!(error = %e, "Completion failed"),
        }
        outcome
    }

    async fn dispatch(
        &self,
        grant: &TokenGrant,
        request: &CompletionRequest,
        mode: CompletionMode,
    ) -> Result<CompletionResult, CompletionError> {
        match mode {
            CompletionMode::Batch => self.backend.complete(grant, request).await,
            CompletionMode::Streaming { deltas } => {
                let stream = self.backend.stream(grant, request).await?;
                self.drain(stream, deltas).await
            }
        }
    }

    async fn drain(
        &self,
        mut stream: DeltaStream,
        deltas: Option<mpsc::Sender<String>>,
    ) -> Result<CompletionResult, CompletionError> {
        let mut acc = StreamAccumulator::new();
        let mut forward = deltas;

        loop {
            let next = tokio::time::timeout(self.idle_timeout, stream.next())
                .await
                .map_err(|_| {
                    CompletionError::TransportFailure(format!(
                        "no stream data for {}s",
                        self.idle_timeout.as_secs()
                    ))
                })?;

            let Some(chunk) = next else { break };
            let Some(delta) = acc.push(chunk?) else {
                continue;
            };

            if let Some(tx) = &forward {
                if tx.send(delta).await.is_err() {
                    tracing::debug!("Delta receiver dropped, accumulating only");
                    forward = None;
                }
            }
        }

        tracing::debug!(chunks = acc.chunks(), "Stream drained");
        Ok(acc.finish())
    }
}
