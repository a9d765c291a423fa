//! Token acquisition for every flow the chat uses, behind one cache.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use secrecy::{ExposeSecret, Secret};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::claims::{self, IdentityClaims};
use super::entra::{EntraClient, TokenResponse};
use crate::error::AuthError;
use crate::models::grant::digest;
use crate::models::{AccountId, GrantOrigin, Scope, TokenGrant, UserAssertion};

/// Grants are treated as expired this long before the provider says so.
pub const EXPIRY_SKEW_SECS: i64 = 60;

/// How a grant is obtained. Each variant names its subject and target scope.
#[derive(Debug, Clone)]
pub enum TokenStrategy {
    /// The application's own identity: client secret, then managed identity.
    ServiceCredential { scope: Scope },
    /// Redeem an authorization code from the sign-in redirect.
    UserDelegated { code: Secret<String>, scope: Scope },
    /// Exchange a user assertion for a downstream grant.
    OnBehalfOf { assertion: UserAssertion, scope: Scope },
    /// Refresh-token grant for an account signed in earlier.
    SilentApplication { account: AccountId, scope: Scope },
}

impl TokenStrategy {
    pub fn kind(&self) -> &'static str {
        match self {
            TokenStrategy::ServiceCredential { .. } => "service_credential",
            TokenStrategy::UserDelegated { .. } => "user_delegated",
            TokenStrategy::OnBehalfOf { .. } => "on_behalf_of",
            TokenStrategy::SilentApplication { .. } => "silent_application",
        }
    }

    pub fn scope(&self) -> &Scope {
        match self {
            TokenStrategy::ServiceCredential { scope }
            | TokenStrategy::UserDelegated { scope, .. }
            | TokenStrategy::OnBehalfOf { scope, .. }
            | TokenStrategy::SilentApplication { scope, .. } => scope,
        }
    }

    fn cache_key(&self) -> CacheKey {
        let subject = match self {
            TokenStrategy::ServiceCredential { .. } => String::new(),
            TokenStrategy::UserDelegated { code, .. } => digest(code.expose_secret()),
            TokenStrategy::OnBehalfOf { assertion, .. } => assertion.digest(),
            TokenStrategy::SilentApplication { account, .. } => digest(account.as_str()),
        };

        CacheKey {
            kind: self.kind(),
            subject,
            scope: self.scope().clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    kind: &'static str,
    /// SHA-256 of the subject; raw assertions and codes are never kept.
    subject: String,
    scope: Scope,
}

struct CachedAccount {
    refresh_token: Secret<String>,
}

type GrantSlot = Arc<Mutex<Option<TokenGrant>>>;

pub struct TokenBroker {
    entra: Arc<EntraClient>,
    grants: DashMap<CacheKey, GrantSlot>,
    accounts: DashMap<AccountId, CachedAccount>,
    skew: Duration,
}

impl TokenBroker {
    pub fn new(entra: Arc<EntraClient>) -> Self {
        Self {
            entra,
            grants: DashMap::new(),
            accounts: DashMap::new(),
            skew: Duration::seconds(EXPIRY_SKEW_SECS),
        }
    }

    pub fn entra(&self) -> &EntraClient {
        &self.entra
    }

    /// Cached grant if still fresh, else a new one from the provider.
    ///
    /// Callers needing the same key wait on that key's lock only; nothing
    /// else is held across the provider call.
    #[tracing::instrument(skip(self, strategy), fields(kind = strategy.kind(), scope = %strategy.scope()))]
    pub async fn acquire(&self, strategy: &TokenStrategy) -> Result<TokenGrant, AuthError> {
        match strategy {
            TokenStrategy::OnBehalfOf { assertion, .. } => check_assertion_lifetime(assertion)?,
            // Codes are single use, never served from the cache.
            TokenStrategy::UserDelegated { scope, .. } => {
                check_sign_in_scope(scope)?;
                return self.fetch(strategy).await;
            }
            _ => {}
        }

        let slot: GrantSlot = self.grants.entry(strategy.cache_key()).or_default().clone();
        let mut cached = slot.lock().await;

        if let Some(grant) = cached.as_ref() {
            if !grant.is_expired_at(Utc::now(), self.skew) {
                tracing::debug!("Token cache hit");
                return Ok(grant.clone());
            }
        }

        let grant = self.fetch(strategy).await?;
        tracing::info!(
            origin = grant.origin().label(),
            expires_at = %grant.expires_at(),
            "Token acquired"
        );
        *cached = Some(grant.clone());
        Ok(grant)
    }

    /// A handle that re-acquires through this broker on every call.
    pub fn provider(self: &Arc<Self>, strategy: TokenStrategy) -> TokenProvider {
        TokenProvider {
            broker: Arc::clone(self),
            strategy,
        }
    }

    pub fn has_account(&self, account: &AccountId) -> bool {
        self.accounts.contains_key(account)
    }

    /// Drop the refresh token and silent grants of an account.
    pub fn forget_account(&self, account: &AccountId) {
        self.accounts.remove(account);
        let subject = digest(account.as_str());
        self.grants
            .retain(|key, _| !(key.kind == "silent_application" && key.subject == subject));
    }

    /// Remove expired grants nobody is currently refreshing.
    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.grants.len();
        self.grants.retain(|_, slot| match slot.try_lock() {
            Ok(grant) => grant
                .as_ref()
                .map(|g| !g.is_expired_at(now, self.skew))
                .unwrap_or(false),
            Err(_) => true,
        });
        before.saturating_sub(self.grants.len())
    }

    async fn fetch(&self, strategy: &TokenStrategy) -> Result<TokenGrant, AuthError> {
        match strategy {
            TokenStrategy::ServiceCredential { scope } => self.service_credential(scope).await,
            TokenStrategy::UserDelegated { code, scope } => {
                self.redeem(code.expose_secret(), scope).await
            }
            TokenStrategy::OnBehalfOf { assertion, scope } => {
                let response = self.entra.on_behalf_of(assertion.expose(), scope).await?;
                Ok(into_grant(response, scope, GrantOrigin::OnBehalfOf))
            }
            TokenStrategy::SilentApplication { account, scope } => {
                self.silent(account, scope).await
            }
        }
    }

    async fn service_credential(&self, scope: &Scope) -> Result<TokenGrant, AuthError> {
        let settings = &self.entra.settings().service_credential;

        let secret_configured = settings.client_secret_enabled
            && !self.entra.settings().client_secret.expose_secret().is_empty();
        if secret_configured {
            match self.entra.client_credentials(scope).await {
                Ok(response) => {
                    return Ok(into_grant(response, scope, GrantOrigin::ServicePrincipal));
                }
                Err(AuthError::CredentialUnavailable(detail)) if settings.managed_identity.is_some() => {
                    tracing::warn!(detail = %detail, "Client secret rejected, trying managed identity");
                }
                Err(e) => return Err(e),
            }
        }

        match &settings.managed_identity {
            Some(identity) => {
                let response = self.entra.managed_identity(identity, scope).await?;
                Ok(into_grant(response, scope, GrantOrigin::ServicePrincipal))
            }
            None => Err(AuthError::CredentialUnavailable(
                "neither a client secret nor a managed identity is configured".to_string(),
            )),
        }
    }

    async fn redeem(&self, code: &str, scope: &Scope) -> Result<TokenGrant, AuthError> {
        let response = self.entra.redeem_code(code).await?;

        let account = response
            .id_token
            .as_deref()
            .and_then(|token| claims::decode_claims::<IdentityClaims>(token).ok())
            .and_then(|c| match (c.oid, c.tid) {
                (Some(oid), Some(tid)) => Some(AccountId::new(&oid, &tid)),
                _ => None,
            });

        match (&account, &response.refresh_token) {
            (Some(account), Some(refresh_token)) => {
                self.accounts.insert(
                    account.clone(),
                    CachedAccount {
                        refresh_token: Secret::new(refresh_token.clone()),
                    },
                );
                tracing::info!(account = %account, "Account cached for silent acquisition");
            }
            _ => tracing::warn!("Sign-in returned no refresh token or account id; silent acquisition unavailable"),
        }

        let origin = GrantOrigin::UserDelegated {
            id_token: response.id_token.clone().map(UserAssertion::new),
            account,
        };
        Ok(into_grant(response, scope, origin))
    }

    async fn silent(&self, account: &AccountId, scope: &Scope) -> Result<TokenGrant, AuthError> {
        // Clone out so no map guard lives across the request.
        let refresh_token = self
            .accounts
            .get(account)
            .map(|cached| cached.refresh_token.clone())
            .ok_or(AuthError::NoCachedAccount)?;

        let response = match self.entra.refresh(refresh_token.expose_secret(), scope).await {
            Ok(response) => response,
            Err(AuthError::InvalidGrant(detail)) => {
                tracing::warn!(account = %account, "Refresh token rejected, forgetting account");
                self.accounts.remove(account);
                return Err(AuthError::InvalidGrant(detail));
            }
            Err(e) => return Err(e),
        };

        if let Some(rotated) = response.refresh_token.as_ref() {
            if let Some(mut cached) = self.accounts.get_mut(account) {
                cached.refresh_token = Secret::new(rotated.clone());
            }
        }

        Ok(into_grant(response, scope, GrantOrigin::Application))
    }
}

fn into_grant(response: TokenResponse, scope: &Scope, origin: GrantOrigin) -> TokenGrant {
    let lifetime = response.lifetime_secs();
    TokenGrant::new(response.access_token, lifetime, Utc::now(), scope.clone(), origin)
}

/// Sign-in redeems the code for Graph's `User.Read` and nothing else, so the
/// grant can only be labelled with that scope.
fn check_sign_in_scope(scope: &Scope) -> Result<(), AuthError> {
    let sign_in = Scope::graph_user_read();
    if *scope == sign_in {
        Ok(())
    } else {
        Err(AuthError::InvalidGrant(format!(
            "authorization codes are redeemed for {}, not {}",
            sign_in, scope
        )))
    }
}

/// Opaque assertions are left to the provider to judge.
fn check_assertion_lifetime(assertion: &UserAssertion) -> Result<(), AuthError> {
    match claims::expires_at(assertion.expose()) {
        Some(exp) if exp <= Utc::now() => {
            tracing::warn!(expired_at = %exp, "User assertion lapsed before exchange");
            Err(AuthError::AssertionExpired)
        }
        _ => Ok(()),
    }
}

/// Fresh-or-cached grant for one fixed strategy.
#[derive(Clone)]
pub struct TokenProvider {
    broker: Arc<TokenBroker>,
    strategy: TokenStrategy,
}

impl TokenProvider {
    pub async fn token(&self) -> Result<TokenGrant, AuthError> {
        self.broker.acquire(&self.strategy).await
    }

    pub fn strategy(&self) -> &TokenStrategy {
        &self.strategy
    }
}
