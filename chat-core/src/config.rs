use secrecy::Secret;
use serde::Deserialize;

use crate::models::Scope;

/// Entra ID application registration used for the user sign-in flows.
#[derive(Debug, Deserialize, Clone)]
pub struct IdentitySettings {
    /// Authority host, e.g. `https://login.microsoftonline.com`.
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub redirect_uri: String,
    /// Microsoft Graph base URL used for the profile lookup.
    #[serde(default = "default_graph_endpoint")]
    pub graph_endpoint: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub service_credential: ServiceCredentialSettings,
}

impl IdentitySettings {
    pub fn token_endpoint(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }

    pub fn authorize_endpoint(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/authorize",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }

    /// Scope the application exposes for delegated access to itself.
    pub fn application_scope(&self) -> Scope {
        Scope::user_impersonation(&self.client_id)
    }
}

fn default_authority_host() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_graph_endpoint() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

/// Sources tried, in order, for the application's own (non-user) credential.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceCredentialSettings {
    /// Use the registration's client secret with the client-credentials grant.
    #[serde(default = "default_true")]
    pub client_secret_enabled: bool,
    #[serde(default)]
    pub managed_identity: Option<ManagedIdentitySettings>,
}

impl Default for ServiceCredentialSettings {
    fn default() -> Self {
        Self {
            client_secret_enabled: true,
            managed_identity: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// App Service style managed identity endpoint (`IDENTITY_ENDPOINT`/`IDENTITY_HEADER`).
#[derive(Debug, Deserialize, Clone)]
pub struct ManagedIdentitySettings {
    pub endpoint: String,
    pub header: Secret<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionBackendKind {
    AzureOpenai,
    Mock,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionSettings {
    #[serde(default = "default_backend")]
    pub backend: CompletionBackendKind,
    /// Azure OpenAI resource endpoint, e.g. `https://my-aoai.openai.azure.com`.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Scope every completion grant must carry.
    #[serde(default = "default_resource_scope")]
    pub resource_scope: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum silence between two streamed chunks.
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
}

fn default_backend() -> CompletionBackendKind {
    CompletionBackendKind::AzureOpenai
}

fn default_api_version() -> String {
    "2024-06-01".to_string()
}

fn default_resource_scope() -> String {
    Scope::COGNITIVE_SERVICES.to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_stream_idle_timeout_secs() -> u64 {
    30
}

/// Conversation policy and the knobs the chat page offers.
#[derive(Debug, Deserialize, Clone)]
pub struct ChatSettings {
    #[serde(default = "default_application_name")]
    pub application_name: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_greeting")]
    pub greeting: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    /// Models that accept image content.
    #[serde(default = "default_vision_models")]
    pub vision_models: Vec<String>,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            application_name: default_application_name(),
            system_prompt: default_system_prompt(),
            greeting: default_greeting(),
            default_model: default_model(),
            models: default_models(),
            vision_models: default_vision_models(),
            default_max_tokens: default_max_tokens(),
        }
    }
}

impl ChatSettings {
    pub fn supports_images(&self, model: &str) -> bool {
        self.vision_models.iter().any(|m| m == model)
    }
}

fn default_application_name() -> String {
    "Azure OpenAI Chatbot".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful assistant".to_string()
}

fn default_greeting() -> String {
    "Hello!".to_string()
}

fn default_model() -> String {
    "gpt-35-turbo".to_string()
}

fn default_models() -> Vec<String> {
    vec!["gpt-35-turbo".to_string(), "gpt-4o".to_string()]
}

fn default_vision_models() -> Vec<String> {
    vec!["gpt-4o".to_string()]
}

fn default_max_tokens() -> u32 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetrySettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// OTLP collector; span export is disabled when unset.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            otlp_endpoint: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
