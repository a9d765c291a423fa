//! Wire client for the Entra ID v2.0 endpoints.
//!
//! Knows request shapes and error codes; caching and strategy selection live
//! in the broker.

use chrono::Utc;
use reqwest::{Client, Url};
use secrecy::ExposeSecret;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

use crate::config::{IdentitySettings, ManagedIdentitySettings};
use crate::error::AuthError;
use crate::models::Scope;
use crate::observability::TracedClientExt;

/// Scopes requested at sign-in. Entra adds the OIDC ones implicitly; we
/// request them so an id token and a refresh token come back.
pub const SIGN_IN_SCOPES: &[&str] = &[Scope::GRAPH_USER_READ, "openid", "profile", "offline_access"];

const MANAGED_IDENTITY_API_VERSION: &str = "2019-08-01";
const DEFAULT_EXPIRES_IN: u64 = 3600;

// AADSTS codes with a meaning of their own.
const AADSTS_ASSERTION_EXPIRED: u32 = 500133;
const AADSTS_CONSENT_REQUIRED: u32 = 65001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    AuthorizationCode,
    ClientCredentials,
    OnBehalfOf,
    RefreshToken,
    ManagedIdentity,
}

impl Flow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flow::AuthorizationCode => "authorization_code",
            Flow::ClientCredentials => "client_credentials",
            Flow::OnBehalfOf => "on_behalf_of",
            Flow::RefreshToken => "refresh_token",
            Flow::ManagedIdentity => "managed_identity",
        }
    }
}

/// Successful token endpoint response.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, deserialize_with = "number_or_string")]
    pub expires_in: Option<u64>,
    /// Managed identity reports an absolute epoch instead.
    #[serde(default, deserialize_with = "number_or_string")]
    pub expires_on: Option<u64>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenResponse {
    pub fn lifetime_secs(&self) -> u64 {
        if let Some(expires_in) = self.expires_in {
            return expires_in;
        }
        self.expires_on
            .map(|on| on.saturating_sub(Utc::now().timestamp().max(0) as u64))
            .unwrap_or(DEFAULT_EXPIRES_IN)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
    #[serde(default)]
    error_codes: Vec<u32>,
    #[serde(default)]
    suberror: Option<String>,
}

fn number_or_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Some(n),
        Some(Raw::Text(s)) => s.parse().ok(),
        None => None,
    })
}

pub struct EntraClient {
    client: Client,
    settings: IdentitySettings,
}

impl EntraClient {
    pub fn new(settings: IdentitySettings) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .build()
            .map_err(|e| AuthError::ProviderUnavailable(format!("HTTP client: {}", e)))?;

        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &IdentitySettings {
        &self.settings
    }

    pub(crate) fn http(&self) -> &Client {
        &self.client
    }

    /// Provider sign-in URL for the authorization-code flow.
    pub fn authorization_url(&self, state: &str) -> Result<String, AuthError> {
        let scope = SIGN_IN_SCOPES.join(" ");
        let url = Url::parse_with_params(
            &self.settings.authorize_endpoint(),
            &[
                ("client_id", self.settings.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.settings.redirect_uri.as_str()),
                ("response_mode", "query"),
                ("scope", scope.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| AuthError::CredentialUnavailable(format!("Invalid authority URL: {}", e)))?;

        Ok(url.to_string())
    }

    pub async fn redeem_code(&self, code: &str) -> Result<TokenResponse, AuthError> {
        let scope = SIGN_IN_SCOPES.join(" ");
        self.token_request(
            Flow::AuthorizationCode,
            &Scope::graph_user_read(),
            &[
                ("grant_type", "authorization_code"),
                ("client_id", &self.settings.client_id),
                ("client_secret", self.settings.client_secret.expose_secret()),
                ("code", code),
                ("redirect_uri", &self.settings.redirect_uri),
                ("scope", &scope),
            ],
        )
        .await
    }

    pub async fn client_credentials(&self, scope: &Scope) -> Result<TokenResponse, AuthError> {
        self.token_request(
            Flow::ClientCredentials,
            scope,
            &[
                ("grant_type", "client_credentials"),
                ("client_id", &self.settings.client_id),
                ("client_secret", self.settings.client_secret.expose_secret()),
                ("scope", scope.as_str()),
            ],
        )
        .await
    }

    pub async fn on_behalf_of(
        &self,
        assertion: &str,
        scope: &Scope,
    ) -> Result<TokenResponse, AuthError> {
        self.token_request(
            Flow::OnBehalfOf,
            scope,
            &[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("client_id", &self.settings.client_id),
                ("client_secret", self.settings.client_secret.expose_secret()),
                ("assertion", assertion),
                ("requested_token_use", "on_behalf_of"),
                ("scope", scope.as_str()),
            ],
        )
        .await
    }

    pub async fn refresh(
        &self,
        refresh_token: &str,
        scope: &Scope,
    ) -> Result<TokenResponse, AuthError> {
        let scope_param = format!("{} offline_access", scope);
        self.token_request(
            Flow::RefreshToken,
            scope,
            &[
                ("grant_type", "refresh_token"),
                ("client_id", &self.settings.client_id),
                ("client_secret", self.settings.client_secret.expose_secret()),
                ("refresh_token", refresh_token),
                ("scope", &scope_param),
            ],
        )
        .await
    }

    pub async fn managed_identity(
        &self,
        identity: &ManagedIdentitySettings,
        scope: &Scope,
    ) -> Result<TokenResponse, AuthError> {
        let response = self
            .client
            .traced_get(&identity.endpoint)
            .header("X-IDENTITY-HEADER", identity.header.expose_secret())
            .query(&[
                ("api-version", MANAGED_IDENTITY_API_VERSION),
                ("resource", scope.resource()),
            ])
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Managed identity endpoint unreachable");
                AuthError::ProviderUnavailable(e.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Managed identity token request failed");
            return Err(AuthError::CredentialUnavailable(format!(
                "managed identity returned {}",
                status
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::MalformedResponse(e.to_string()))
    }

    async fn token_request(
        &self,
        flow: Flow,
        scope: &Scope,
        params: &[(&str, &str)],
    ) -> Result<TokenResponse, AuthError> {
        let endpoint = self.settings.token_endpoint();

        let response = self
            .client
            .traced_post(&endpoint)
            .form(params)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(flow = flow.as_str(), error = %e, "Token endpoint unreachable");
                AuthError::ProviderUnavailable(e.to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<TokenResponse>().await.map_err(|e| {
                tracing::error!(flow = flow.as_str(), error = %e, "Failed to parse token response");
                AuthError::MalformedResponse(e.to_string())
            });
        }

        let body = response.text().await.unwrap_or_default();
        let error: ErrorResponse = serde_json::from_str(&body).unwrap_or_default();
        tracing::error!(
            flow = flow.as_str(),
            status = %status,
            error = %error.error,
            error_codes = ?error.error_codes,
            description = %error.error_description,
            "Token request rejected"
        );

        Err(classify(flow, status.as_u16(), scope, error))
    }
}

fn classify(flow: Flow, status: u16, scope: &Scope, error: ErrorResponse) -> AuthError {
    let detail = if error.error_description.is_empty() {
        error.error.clone()
    } else {
        error.error_description.clone()
    };

    if error.error_codes.contains(&AADSTS_ASSERTION_EXPIRED) {
        return AuthError::AssertionExpired;
    }

    let consent_missing = error.error_codes.contains(&AADSTS_CONSENT_REQUIRED)
        || error.error == "consent_required"
        || error.error == "invalid_scope"
        || error.suberror.as_deref() == Some("consent_required");
    if flow == Flow::OnBehalfOf && consent_missing {
        return AuthError::DelegationDenied {
            scope: scope.to_string(),
            detail,
        };
    }

    match error.error.as_str() {
        "invalid_client" | "unauthorized_client" => AuthError::CredentialUnavailable(detail),
        "invalid_grant" | "interaction_required" => AuthError::InvalidGrant(detail),
        _ if status >= 500 => AuthError::ProviderUnavailable(format!("{}: {}", status, detail)),
        _ => AuthError::InvalidGrant(detail),
    }
}
