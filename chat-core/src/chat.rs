//! One chat turn, end to end: grant, append, complete, strip, compact.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::{DelegationMode, IdentityService, IdentitySession};
use crate::completion::{CompletionGateway, CompletionMode, CompletionRequest};
use crate::config::ChatSettings;
use crate::conversation::ConversationStore;
use crate::error::{ChatError, CompletionError};
use crate::models::{CompletionResult, ImageRef, MessageId, RequestMetadata};

/// Per-user state. One writer at a time; the caller owns the locking.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub identity: IdentitySession,
    pub conversation: ConversationStore,
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub prompt: String,
    pub image: Option<ImageRef>,
    pub model: String,
    pub max_tokens: u32,
    pub delegation: DelegationMode,
}

#[derive(Debug, Clone)]
pub struct TurnReport {
    pub result: CompletionResult,
    pub user_message: MessageId,
    pub assistant_message: MessageId,
    pub compacted: bool,
    /// Set when compaction was attempted and failed; the turn itself stands.
    pub compaction_error: Option<CompletionError>,
}

pub struct ChatService {
    identity: Arc<IdentityService>,
    gateway: CompletionGateway,
    settings: ChatSettings,
}

impl ChatService {
    pub fn new(identity: Arc<IdentityService>, gateway: CompletionGateway, settings: ChatSettings) -> Self {
        Self {
            identity,
            gateway,
            settings,
        }
    }

    pub fn identity(&self) -> &IdentityService {
        &self.identity
    }

    pub fn gateway(&self) -> &CompletionGateway {
        &self.gateway
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn new_session(&self) -> ChatSession {
        ChatSession {
            identity: IdentitySession::Anonymous,
            conversation: ConversationStore::new(&self.settings.system_prompt, &self.settings.greeting),
        }
    }

    pub async fn login(
        &self,
        session: &mut ChatSession,
        code: &str,
        metadata: &RequestMetadata,
    ) -> Result<(), ChatError> {
        self.identity
            .complete_login(&mut session.identity, code, metadata)
            .await?;
        Ok(())
    }

    /// Anonymous identity and a fresh conversation.
    pub fn logout(&self, session: &mut ChatSession) {
        self.identity.logout(&mut session.identity);
        session
            .conversation
            .reset(&self.settings.system_prompt, &self.settings.greeting);
    }

    /// Run one user turn.
    ///
    /// If the completion fails the user message is retracted, so the log is
    /// exactly as before the call.
    #[tracing::instrument(
        skip_all,
        fields(model = %request.model, delegation = ?request.delegation, mode = mode.label())
    )]
    pub async fn run_turn(
        &self,
        session: &mut ChatSession,
        request: TurnRequest,
        mode: CompletionMode,
        cancel: &CancellationToken,
    ) -> Result<TurnReport, ChatError> {
        if request.image.is_some() && !self.settings.supports_images(&request.model) {
            return Err(ChatError::ImageNotSupported(request.model));
        }

        let grant = self
            .identity
            .completion_grant(&session.identity, request.delegation)
            .await?;
        let security_context = session.identity.security_context().cloned();

        let had_image = request.image.is_some();
        let user_message = session
            .conversation
            .append_user(&request.prompt, request.image);

        let completion = CompletionRequest {
            model: request.model.clone(),
            messages: session.conversation.messages().to_vec(),
            max_tokens: request.max_tokens,
            security_context: security_context.clone(),
        };

        let result = match self.gateway.complete(&grant, &completion, mode, cancel).await {
            Ok(result) => result,
            Err(e) => {
                if let Err(retract) = session.conversation.retract(user_message) {
                    tracing::error!(error = %retract, "Failed to roll back user message");
                }
                return Err(e.into());
            }
        };

        let assistant_message = session.conversation.append_assistant(result.text());
        if had_image {
            session
                .conversation
                .strip_image(user_message, &request.prompt)?;
        }

        let gateway = &self.gateway;
        let grant = &grant;
        let model = request.model;
        let max_tokens = request.max_tokens;
        let compaction = session
            .conversation
            .maybe_compact(|messages| async move {
                let summary = CompletionRequest {
                    model,
                    messages,
                    max_tokens,
                    security_context,
                };
                gateway
                    .complete(grant, &summary, CompletionMode::Batch, cancel)
                    .await
            })
            .await;

        let (compacted, compaction_error) = match compaction {
            Ok(compacted) => (compacted, None),
            Err(e) => {
                tracing::error!(error = %e, "Conversation compaction failed, keeping full log");
                (false, Some(e))
            }
        };

        Ok(TurnReport {
            result,
            user_message,
            assistant_message,
            compacted,
            compaction_error,
        })
    }
}
