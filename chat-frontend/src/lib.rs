pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod services;
pub mod startup;

use chat_core::auth::{EntraClient, IdentityService, TokenBroker};
use chat_core::completion::CompletionGateway;
use chat_core::models::Scope;
use chat_core::ChatService;
use std::sync::Arc;
use tower_sessions::Session;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::AppError;
use crate::middleware::auth::SESSION_ID_KEY;
use crate::services::{SessionHandle, SessionRegistry};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub sessions: SessionRegistry,
    pub secure_cookies: bool,
    pub session_idle: time::Duration,
}

impl AppState {
    pub fn new(chat: Arc<ChatService>) -> Self {
        Self {
            chat,
            sessions: SessionRegistry::new(),
            secure_cookies: false,
            session_idle: time::Duration::hours(24),
        }
    }

    /// Wire the identity broker, the completion gateway and the chat service
    /// from configuration.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let entra = EntraClient::new(settings.identity.clone())
            .map_err(|e| anyhow::anyhow!("Failed to build identity client: {}", e))?;
        let broker = Arc::new(TokenBroker::new(Arc::new(entra)));

        let identity = IdentityService::new(
            broker,
            settings.chat.application_name.clone(),
            Scope::new(settings.completion.resource_scope.clone()),
        );
        let gateway = CompletionGateway::from_settings(&settings.completion)
            .map_err(|e| anyhow::anyhow!("Failed to build completion gateway: {}", e))?;

        tracing::info!(
            backend = gateway.backend_name(),
            scope = %gateway.scope(),
            "Completion gateway ready"
        );

        let chat = ChatService::new(Arc::new(identity), gateway, settings.chat.clone());

        Ok(Self {
            chat: Arc::new(chat),
            sessions: SessionRegistry::new(),
            secure_cookies: settings.server.secure_cookies,
            session_idle: time::Duration::hours(settings.server.session_idle_hours),
        })
    }

    /// The chat session bound to this browser, created on first use.
    pub async fn chat_session(&self, cookie: &Session) -> Result<SessionHandle, AppError> {
        let existing: Option<Uuid> = cookie
            .get(SESSION_ID_KEY)
            .await
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Session store error: {}", e)))?;

        let id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                cookie.insert(SESSION_ID_KEY, id).await.map_err(|e| {
                    AppError::InternalError(anyhow::anyhow!("Session store error: {}", e))
                })?;
                id
            }
        };

        Ok(self.sessions.get_or_create(id, || self.chat.new_session()))
    }

    /// Drop the server-side chat session bound to this browser, if any.
    pub async fn forget_chat_session(&self, cookie: &Session) -> Option<SessionHandle> {
        let id: Option<Uuid> = cookie.get(SESSION_ID_KEY).await.unwrap_or(None);
        id.and_then(|id| self.sessions.remove(&id))
    }
}
