use reqwest::{Client, StatusCode};

use crate::error::AuthError;
use crate::models::{Scope, TokenGrant, UserProfile};
use crate::observability::TracedClientExt;

/// Microsoft Graph profile lookup.
pub struct GraphClient {
    client: Client,
    base_url: String,
}

impl GraphClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// `GET /me` with a `User.Read` grant.
    ///
    /// A non-200 answer yields an empty profile so sign-in can still finish;
    /// the security context then falls back to `"unknown"`.
    #[tracing::instrument(skip(self, grant))]
    pub async fn me(&self, grant: &TokenGrant) -> Result<UserProfile, AuthError> {
        let scope = Scope::graph_user_read();
        if !grant.is_scoped_to(&scope) {
            return Err(AuthError::InvalidGrant(format!(
                "Graph requires a {} grant, got {}",
                scope,
                grant.scope()
            )));
        }

        let response = self
            .client
            .traced_get(&format!("{}/me", self.base_url))
            .bearer_auth(grant.bearer())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Graph unreachable");
                AuthError::ProviderUnavailable(e.to_string())
            })?;

        if response.status() != StatusCode::OK {
            tracing::warn!(status = %response.status(), "Graph /me failed, continuing with empty profile");
            return Ok(UserProfile::default());
        }

        response
            .json::<UserProfile>()
            .await
            .map_err(|e| AuthError::MalformedResponse(format!("Graph /me: {}", e)))
    }
}
