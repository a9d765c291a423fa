use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chat_core::auth::DelegationMode;
use chat_core::completion::CompletionMode;
use chat_core::media::prepare_image;
use chat_core::models::{DetailLevel, ImageRef, TranscriptEntry};
use chat_core::{ChatError, CompletionError, TurnReport, TurnRequest};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use crate::error::AppError;
use crate::services::metrics::{record_compaction, record_tokens, record_turn};
use crate::services::SessionHandle;
use crate::AppState;

/// Buffered SSE events per streaming turn.
const EVENT_BUFFER: usize = 32;

#[derive(Debug, Deserialize, Validate)]
pub struct ChatRequest {
    #[validate(length(min = 1, max = 32000, message = "Prompt must be 1-32000 characters"))]
    pub prompt: String,
    pub model: Option<String>,
    #[validate(range(min = 100, max = 10000, message = "max_tokens must be 100-10000"))]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub streaming: bool,
    /// Call the completion API with the user's delegated identity.
    #[serde(default)]
    pub on_behalf_of: bool,
    pub image: Option<ImageUpload>,
}

#[derive(Debug, Deserialize)]
pub struct ImageUpload {
    /// Base64 file content, optionally as a `data:` URL.
    pub data: String,
    #[serde(default)]
    pub detail: DetailLevel,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub reply: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub compacted: bool,
}

impl From<&TurnReport> for ChatResponse {
    fn from(report: &TurnReport) -> Self {
        Self {
            reply: report.result.text().to_string(),
            prompt_tokens: report.result.prompt_tokens(),
            completion_tokens: report.result.completion_tokens(),
            total_tokens: report.result.total_tokens(),
            compacted: report.compacted,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TranscriptResponse {
    pub messages: Vec<TranscriptEntry>,
}

/// `GET /chat/messages`
pub async fn messages_handler(Extension(handle): Extension<SessionHandle>) -> Json<TranscriptResponse> {
    let session = handle.lock().await;
    Json(TranscriptResponse {
        messages: session.conversation.transcript(),
    })
}

/// `POST /chat`
pub async fn chat_handler(
    State(state): State<AppState>,
    Extension(handle): Extension<SessionHandle>,
    Json(payload): Json<ChatRequest>,
) -> Result<Response, AppError> {
    payload.validate()?;

    let settings = state.chat.settings();
    let model = payload
        .model
        .clone()
        .unwrap_or_else(|| settings.default_model.clone());
    if !settings.models.contains(&model) {
        return Err(AppError::BadRequest(anyhow::anyhow!("Unknown model {}", model)));
    }

    let image = match payload.image {
        Some(upload) => Some(decode_upload(upload).await?),
        None => None,
    };

    let turn = TurnRequest {
        prompt: payload.prompt,
        image,
        model,
        max_tokens: payload.max_tokens.unwrap_or(settings.default_max_tokens),
        delegation: if payload.on_behalf_of {
            DelegationMode::OnBehalfOfUser
        } else {
            DelegationMode::ServicePrincipal
        },
    };

    if payload.streaming {
        Ok(stream_turn(state, handle, turn).into_response())
    } else {
        let report = batch_turn(state, handle, turn).await?;
        Ok(Json(ChatResponse::from(&report)).into_response())
    }
}

async fn decode_upload(upload: ImageUpload) -> Result<ImageRef, AppError> {
    let encoded = match upload.data.split_once(";base64,") {
        Some((_, payload)) => payload,
        None => upload.data.as_str(),
    };
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Image is not valid base64: {}", e)))?;

    let detail = upload.detail;
    tokio::task::spawn_blocking(move || prepare_image(&bytes, detail))
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Image task failed: {}", e)))?
        .map_err(|e| AppError::from(ChatError::Media(e)))
}

/// The turn runs in its own task; if the client goes away the token is
/// cancelled and the turn rolls back instead of being dropped half-way.
async fn batch_turn(state: AppState, handle: SessionHandle, turn: TurnRequest) -> Result<TurnReport, AppError> {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let task = tokio::spawn(async move {
        let mut session = handle.lock().await;
        state
            .chat
            .run_turn(&mut session, turn, CompletionMode::Batch, &cancel)
            .await
    });

    let outcome = task
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Chat turn task failed: {}", e)))?;
    record_outcome("batch", &outcome);

    Ok(outcome?)
}

fn stream_turn(
    state: AppState,
    handle: SessionHandle,
    turn: TurnRequest,
) -> Sse<ReceiverStream<Result<Event, Infallible>>> {
    let (event_tx, event_rx) = mpsc::channel::<Result<Event, Infallible>>(EVENT_BUFFER);
    let (delta_tx, mut delta_rx) = mpsc::channel::<String>(EVENT_BUFFER);

    tokio::spawn(async move {
        let forward_tx = event_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(delta) = delta_rx.recv().await {
                let event = Event::default().event("delta").data(delta);
                if forward_tx.send(Ok(event)).await.is_err() {
                    break;
                }
            }
        });

        let cancel = CancellationToken::new();
        let mut session = handle.lock().await;
        let turn = state
            .chat
            .run_turn(&mut session, turn, CompletionMode::streaming_to(delta_tx), &cancel);
        tokio::pin!(turn);

        let outcome = loop {
            tokio::select! {
                outcome = &mut turn => break outcome,
                _ = event_tx.closed(), if !cancel.is_cancelled() => {
                    tracing::info!("Client disconnected, cancelling turn");
                    cancel.cancel();
                }
            }
        };

        // All deltas are queued before the final event.
        if let Err(e) = forwarder.await {
            tracing::error!(error = %e, "Delta forwarder failed");
        }
        record_outcome("streaming", &outcome);

        let event = match outcome {
            Ok(report) => Event::default()
                .event("done")
                .json_data(ChatResponse::from(&report))
                .unwrap_or_else(|_| Event::default().event("done")),
            Err(e) => Event::default().event("error").data(user_message(&e)),
        };
        let _ = event_tx.send(Ok(event)).await;
    });

    Sse::new(ReceiverStream::new(event_rx)).keep_alive(KeepAlive::default())
}

fn record_outcome(mode: &str, outcome: &Result<TurnReport, ChatError>) {
    match outcome {
        Ok(report) => {
            record_turn(mode, "success");
            record_tokens(report.result.prompt_tokens(), report.result.completion_tokens());
            if report.compacted {
                record_compaction("success");
            } else if report.compaction_error.is_some() {
                record_compaction("failure");
            }
        }
        Err(ChatError::Completion(CompletionError::Cancelled)) => record_turn(mode, "cancelled"),
        Err(e) => {
            tracing::warn!(error = %e, mode = mode, "Chat turn failed");
            record_turn(mode, "failure");
        }
    }
}

/// Text shown in the chat for a failed streaming turn.
fn user_message(err: &ChatError) -> String {
    match err {
        ChatError::Auth(_) => "Authentication required".to_string(),
        ChatError::Completion(e) => format!("The assistant could not answer: {}", e),
        other => other.to_string(),
    }
}
