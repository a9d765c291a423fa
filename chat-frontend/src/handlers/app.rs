use axum::{extract::State, Json};
use serde::Serialize;
use tower_sessions::Session;

use crate::error::AppError;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct IndexResponse {
    pub application: String,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_url: Option<String>,
    pub models: Vec<String>,
    pub default_model: String,
}

#[derive(Debug, Serialize)]
pub struct UserSummary {
    pub display_name: String,
    pub user_principal_name: String,
}

/// Landing document: who is signed in, or where to sign in.
pub async fn index(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<IndexResponse>, AppError> {
    let handle = state.chat_session(&session).await?;
    let user = handle
        .lock()
        .await
        .identity
        .identity()
        .map(|identity| UserSummary {
            display_name: identity.profile().display_name.clone(),
            user_principal_name: identity.profile().user_principal_name.clone(),
        });

    let settings = state.chat.settings();
    Ok(Json(IndexResponse {
        application: settings.application_name.clone(),
        authenticated: user.is_some(),
        login_url: user.is_none().then(|| "/login".to_string()),
        user,
        models: settings.models.clone(),
        default_model: settings.default_model.clone(),
    }))
}

pub async fn health_check() -> &'static str {
    "OK"
}
