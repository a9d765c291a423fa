//! Shared setup for chat-core integration tests.
//!
//! Entra ID, Graph and Azure OpenAI are all served by one wiremock server.

#![allow(dead_code)]

use base64::{engine::general_purpose, Engine as _};
use chat_core::auth::{EntraClient, IdentityService, TokenBroker};
use chat_core::config::{IdentitySettings, ServiceCredentialSettings};
use chat_core::models::Scope;
use secrecy::Secret;
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::MockServer;

pub const TENANT_ID: &str = "tenant-1";
pub const CLIENT_ID: &str = "client-1";
pub const TOKEN_PATH: &str = "/tenant-1/oauth2/v2.0/token";

pub fn identity_settings(server: &MockServer) -> IdentitySettings {
    IdentitySettings {
        authority_host: server.uri(),
        tenant_id: TENANT_ID.to_string(),
        client_id: CLIENT_ID.to_string(),
        client_secret: Secret::new("client-secret".to_string()),
        redirect_uri: "http://localhost:8000/login".to_string(),
        graph_endpoint: format!("{}/v1.0", server.uri()),
        http_timeout_secs: 5,
        service_credential: ServiceCredentialSettings::default(),
    }
}

pub fn broker(settings: IdentitySettings) -> Arc<TokenBroker> {
    let entra = EntraClient::new(settings).expect("Failed to build Entra client");
    Arc::new(TokenBroker::new(Arc::new(entra)))
}

pub fn identity_service(server: &MockServer) -> IdentityService {
    IdentityService::new(
        broker(identity_settings(server)),
        "Azure OpenAI Chatbot",
        Scope::cognitive_services(),
    )
}

/// Unsigned JWT carrying `claims`.
pub fn jwt(claims: Value) -> String {
    let header = general_purpose::URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = general_purpose::URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, payload)
}

pub fn id_token(exp_offset_secs: i64) -> String {
    jwt(json!({
        "oid": "oid-1",
        "tid": TENANT_ID,
        "preferred_username": "ada@contoso.com",
        "exp": chrono::Utc::now().timestamp() + exp_offset_secs,
    }))
}

pub fn token_body(access_token: &str) -> Value {
    json!({
        "token_type": "Bearer",
        "access_token": access_token,
        "expires_in": 3599,
    })
}

pub fn sign_in_body(access_token: &str, refresh_token: &str) -> Value {
    json!({
        "token_type": "Bearer",
        "access_token": access_token,
        "expires_in": 3599,
        "id_token": id_token(3600),
        "refresh_token": refresh_token,
    })
}

pub fn aad_error(error: &str, code: u32) -> Value {
    json!({
        "error": error,
        "error_description": format!("AADSTS{}: simulated failure", code),
        "error_codes": [code],
    })
}
