use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tower_sessions::Session;
use uuid::Uuid;

use crate::AppState;

/// Cookie-session key holding the id of the server-side chat session.
pub const SESSION_ID_KEY: &str = "chat_session_id";

/// Admit only signed-in sessions; the handler receives the session handle as
/// an extension.
pub async fn auth_middleware(
    State(state): State<AppState>,
    session: Session,
    mut request: Request,
    next: Next,
) -> Response {
    let session_id: Option<Uuid> = session.get(SESSION_ID_KEY).await.unwrap_or(None);

    let handle = match session_id.and_then(|id| state.sessions.get(&id)) {
        Some(handle) => handle,
        None => return unauthorized(),
    };

    if !handle.lock().await.identity.is_authenticated() {
        return unauthorized();
    }

    request.extensions_mut().insert(handle);
    next.run(request).await
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Sign in required", "login": "/login" })),
    )
        .into_response()
}
