use secrecy::Secret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::broker::{TokenBroker, TokenStrategy};
use super::graph::GraphClient;
use crate::error::AuthError;
use crate::models::{
    AccountId, RequestMetadata, Scope, SecurityContext, TokenGrant, UserAssertion, UserProfile,
};

/// Everything known about a signed-in user. Built in one piece by
/// [`IdentityService::complete_login`].
#[derive(Debug, Clone)]
pub struct AuthenticatedIdentity {
    user_grant: TokenGrant,
    application_grant: Option<TokenGrant>,
    profile: UserProfile,
    security_context: SecurityContext,
}

impl AuthenticatedIdentity {
    /// `User.Read` grant from the code redemption.
    pub fn user_grant(&self) -> &TokenGrant {
        &self.user_grant
    }

    /// Grant for this application's own delegated scope, when the silent
    /// acquisition after sign-in succeeded.
    pub fn application_grant(&self) -> Option<&TokenGrant> {
        self.application_grant.as_ref()
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn security_context(&self) -> &SecurityContext {
        &self.security_context
    }

    pub fn account(&self) -> Option<&AccountId> {
        self.user_grant.account()
    }

    /// Subject for an on-behalf-of exchange: the application grant's access
    /// token, else the id token.
    pub fn delegation_assertion(&self) -> Option<UserAssertion> {
        self.application_grant
            .as_ref()
            .map(TokenGrant::as_assertion)
            .or_else(|| self.user_grant.id_token().cloned())
    }
}

#[derive(Debug, Clone, Default)]
pub enum IdentitySession {
    #[default]
    Anonymous,
    Authenticated(AuthenticatedIdentity),
}

impl IdentitySession {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, IdentitySession::Authenticated(_))
    }

    pub fn identity(&self) -> Option<&AuthenticatedIdentity> {
        match self {
            IdentitySession::Anonymous => None,
            IdentitySession::Authenticated(identity) => Some(identity),
        }
    }

    pub fn security_context(&self) -> Option<&SecurityContext> {
        self.identity().map(AuthenticatedIdentity::security_context)
    }
}

/// Whose authority a completion call runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationMode {
    #[default]
    ServicePrincipal,
    OnBehalfOfUser,
}

pub struct IdentityService {
    broker: Arc<TokenBroker>,
    graph: GraphClient,
    application_name: String,
    completion_scope: Scope,
}

impl IdentityService {
    pub fn new(
        broker: Arc<TokenBroker>,
        application_name: impl Into<String>,
        completion_scope: Scope,
    ) -> Self {
        let graph = GraphClient::new(
            broker.entra().http().clone(),
            broker.entra().settings().graph_endpoint.clone(),
        );

        Self {
            broker,
            graph,
            application_name: application_name.into(),
            completion_scope,
        }
    }

    pub fn broker(&self) -> &Arc<TokenBroker> {
        &self.broker
    }

    pub fn completion_scope(&self) -> &Scope {
        &self.completion_scope
    }

    /// Provider sign-in URL. `state` comes back on the redirect unchanged.
    pub fn begin_login(&self, state: &str) -> Result<String, AuthError> {
        self.broker.entra().authorization_url(state)
    }

    /// Redeem the code, read the profile and build the security context.
    ///
    /// `session` is assigned once at the end; on error it keeps its prior value.
    #[tracing::instrument(skip_all)]
    pub async fn complete_login(
        &self,
        session: &mut IdentitySession,
        code: &str,
        metadata: &RequestMetadata,
    ) -> Result<(), AuthError> {
        let user_grant = self
            .broker
            .acquire(&TokenStrategy::UserDelegated {
                code: Secret::new(code.to_string()),
                scope: Scope::graph_user_read(),
            })
            .await?;

        let profile = match self.graph.me(&user_grant).await {
            Ok(profile) => profile,
            Err(e) => {
                // The redeemed refresh token must not outlive a failed sign-in.
                if let Some(account) = user_grant.account() {
                    self.broker.forget_account(account);
                }
                return Err(e);
            }
        };

        let application_grant = match user_grant.account() {
            Some(account) => {
                let strategy = TokenStrategy::SilentApplication {
                    account: account.clone(),
                    scope: self.broker.entra().settings().application_scope(),
                };
                match self.broker.acquire(&strategy).await {
                    Ok(grant) => Some(grant),
                    Err(e) => {
                        tracing::warn!(error = %e, "Silent application token unavailable");
                        None
                    }
                }
            }
            None => {
                tracing::warn!("No account id in sign-in response, skipping application token");
                None
            }
        };

        let tenant_id = self.broker.entra().settings().tenant_id.clone();
        let security_context = SecurityContext::derive(
            &self.application_name,
            &profile,
            Some(tenant_id.as_str()),
            metadata,
        );

        tracing::info!(
            end_user_id = security_context.end_user_id(),
            source_ip = security_context.source_ip(),
            "User signed in"
        );

        if let Some(previous) = session.identity().and_then(AuthenticatedIdentity::account) {
            if user_grant.account() != Some(previous) {
                self.broker.forget_account(previous);
            }
        }

        *session = IdentitySession::Authenticated(AuthenticatedIdentity {
            user_grant,
            application_grant,
            profile,
            security_context,
        });

        Ok(())
    }

    /// Local sign-out. Provider-side sessions are left alone.
    pub fn logout(&self, session: &mut IdentitySession) {
        if let Some(account) = session.identity().and_then(AuthenticatedIdentity::account) {
            self.broker.forget_account(account);
        }
        *session = IdentitySession::Anonymous;
    }

    /// Grant for the completion API under the requested authority.
    #[tracing::instrument(skip(self, session))]
    pub async fn completion_grant(
        &self,
        session: &IdentitySession,
        mode: DelegationMode,
    ) -> Result<TokenGrant, AuthError> {
        let strategy = match mode {
            DelegationMode::ServicePrincipal => TokenStrategy::ServiceCredential {
                scope: self.completion_scope.clone(),
            },
            DelegationMode::OnBehalfOfUser => {
                let assertion = session
                    .identity()
                    .and_then(AuthenticatedIdentity::delegation_assertion)
                    .ok_or(AuthError::NoCachedAccount)?;
                TokenStrategy::OnBehalfOf {
                    assertion,
                    scope: self.completion_scope.clone(),
                }
            }
        };

        self.broker.acquire(&strategy).await
    }
}
