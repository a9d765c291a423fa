use askama::Template;
use axum::{
    extract::{ConnectInfo, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
};
use chat_core::models::RequestMetadata;
use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;
use std::net::SocketAddr;
use tower_sessions::Session;

use crate::error::AppError;
use crate::services::metrics::record_login;
use crate::AppState;

/// Cookie-session key for the pending sign-in `state` value.
pub const LOGIN_STATE_KEY: &str = "login_state";

const STATE_LEN: usize = 32;

#[derive(Template)]
#[template(path = "login.html")]
pub struct LoginTemplate {
    pub title: String,
    pub login_url: String,
    pub failed: bool,
}

#[derive(Debug, Deserialize)]
pub struct LoginCallback {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// `GET /login`: without a code, start sign-in; with one, finish it.
pub async fn login_handler(
    State(state): State<AppState>,
    session: Session,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Query(callback): Query<LoginCallback>,
) -> Result<Response, AppError> {
    match callback.code.as_deref() {
        Some(code) => {
            let metadata = request_metadata(&headers, connect_info.map(|ConnectInfo(addr)| addr));
            complete_login(&state, &session, code, callback.state.as_deref(), &metadata).await
        }
        None => {
            if let Some(error) = callback.error.as_deref() {
                tracing::warn!(
                    error = %error,
                    description = callback.error_description.as_deref().unwrap_or(""),
                    "Identity provider returned an error"
                );
            }
            login_page(&state, &session, callback.error.is_some()).await
        }
    }
}

async fn login_page(state: &AppState, session: &Session, failed: bool) -> Result<Response, AppError> {
    let csrf: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(STATE_LEN)
        .map(char::from)
        .collect();

    session
        .insert(LOGIN_STATE_KEY, &csrf)
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Session store error: {}", e)))?;

    let login_url = state
        .chat
        .identity()
        .begin_login(&csrf)
        .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?;

    Ok(LoginTemplate {
        title: state.chat.settings().application_name.clone(),
        login_url,
        failed,
    }
    .into_response())
}

async fn complete_login(
    state: &AppState,
    session: &Session,
    code: &str,
    returned_state: Option<&str>,
    metadata: &RequestMetadata,
) -> Result<Response, AppError> {
    let expected: Option<String> = session
        .remove(LOGIN_STATE_KEY)
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Session store error: {}", e)))?;

    match (expected.as_deref(), returned_state) {
        (Some(expected), Some(returned)) if expected == returned => {}
        _ => {
            record_login("state_mismatch");
            return Err(AppError::BadRequest(anyhow::anyhow!("Invalid sign-in state")));
        }
    }

    let handle = state.chat_session(session).await?;
    let mut chat_session = handle.lock().await;

    match state.chat.login(&mut chat_session, code, metadata).await {
        Ok(()) => {
            record_login("success");
            // New cookie id once the session carries an identity.
            if let Err(e) = session.cycle_id().await {
                tracing::warn!(error = %e, "Failed to rotate session id");
            }
            Ok(Redirect::to("/").into_response())
        }
        Err(e) => {
            record_login("failure");
            tracing::warn!(error = %e, "Sign-in failed");
            Ok(Redirect::to("/login?error=auth_failed").into_response())
        }
    }
}

/// `GET /logout`: forget the account and conversation, then clear the cookie session.
pub async fn logout_handler(State(state): State<AppState>, session: Session) -> impl IntoResponse {
    if let Some(handle) = state.forget_chat_session(&session).await {
        let mut chat_session = handle.lock().await;
        state.chat.logout(&mut chat_session);
    }

    if let Err(e) = session.flush().await {
        tracing::warn!(error = %e, "Failed to clear session");
    }

    Redirect::to("/")
}

/// Client address: first `X-Forwarded-For` hop, else the socket peer.
pub fn request_metadata(headers: &HeaderMap, peer: Option<SocketAddr>) -> RequestMetadata {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    RequestMetadata::new(forwarded.or_else(|| peer.map(|addr| addr.to_string())))
}
