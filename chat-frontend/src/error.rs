use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chat_core::{AuthError, ChatError, CompletionError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(anyhow::Error),

    #[error("Forbidden: {0}")]
    Forbidden(anyhow::Error),

    #[error("Authentication error: {0}")]
    AuthError(AuthError),

    #[error("Bad Gateway: {0}")]
    BadGateway(String),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Auth(AuthError::DelegationDenied { scope, detail }) => {
                AppError::Forbidden(anyhow::anyhow!("Delegation to {} denied: {}", scope, detail))
            }
            ChatError::Auth(AuthError::ProviderUnavailable(_))
            | ChatError::Auth(AuthError::CredentialUnavailable(_)) => {
                tracing::error!(error = %err, "Identity provider unavailable");
                AppError::ServiceUnavailable
            }
            ChatError::Auth(auth) => AppError::AuthError(auth),
            ChatError::Completion(CompletionError::Cancelled) => {
                AppError::BadRequest(anyhow::anyhow!("Request cancelled"))
            }
            ChatError::Completion(completion) => AppError::BadGateway(completion.to_string()),
            ChatError::Media(media) => AppError::BadRequest(anyhow::Error::new(media)),
            ChatError::ImageNotSupported(model) => {
                AppError::BadRequest(anyhow::anyhow!("Model {} does not accept images", model))
            }
            ChatError::Conversation(conversation) => {
                AppError::InternalError(anyhow::Error::new(conversation))
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
        }

        let (status, error_message, details) = match self {
            AppError::ValidationError(err) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Validation error".to_string(),
                Some(err.to_string()),
            ),
            AppError::BadRequest(err) => (StatusCode::BAD_REQUEST, err.to_string(), None),
            AppError::Unauthorized(err) => (StatusCode::UNAUTHORIZED, err.to_string(), None),
            AppError::Forbidden(err) => (StatusCode::FORBIDDEN, err.to_string(), None),
            // Provider detail stays in the log, not in the response.
            AppError::AuthError(err) => {
                tracing::warn!(error = %err, "Authentication failed");
                (
                    StatusCode::UNAUTHORIZED,
                    "Authentication required".to_string(),
                    None,
                )
            }
            AppError::BadGateway(msg) => {
                tracing::error!(error = %msg, "Completion failed");
                (
                    StatusCode::BAD_GATEWAY,
                    "Completion service error".to_string(),
                    Some(msg),
                )
            }
            AppError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable".to_string(),
                None,
            ),
            AppError::InternalError(err) => {
                tracing::error!(error = ?err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                )
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: error_message,
                details,
            }),
        )
            .into_response()
    }
}
