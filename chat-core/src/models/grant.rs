use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// OAuth scope a grant was issued for. One audience per grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    pub const GRAPH_USER_READ: &'static str = "User.Read";
    pub const COGNITIVE_SERVICES: &'static str = "https://cognitiveservices.azure.com/.default";

    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    pub fn graph_user_read() -> Self {
        Self::new(Self::GRAPH_USER_READ)
    }

    pub fn cognitive_services() -> Self {
        Self::new(Self::COGNITIVE_SERVICES)
    }

    /// Delegated scope an application exposes for itself.
    pub fn user_impersonation(client_id: &str) -> Self {
        Self(format!("api://{}/user_impersonation", client_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resource URI form (`/.default` stripped), as managed identity expects.
    pub fn resource(&self) -> &str {
        self.0.strip_suffix("/.default").unwrap_or(&self.0)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signed JWT presented as the subject of an on-behalf-of exchange.
#[derive(Clone)]
pub struct UserAssertion(Secret<String>);

impl UserAssertion {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Secret::new(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Stable, non-reversible key for caches and logs.
    pub fn digest(&self) -> String {
        digest(self.expose())
    }
}

impl fmt::Debug for UserAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UserAssertion([REDACTED])")
    }
}

pub(crate) fn digest(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Signed-in account in the broker's cache, `<oid>.<tid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(object_id: &str, tenant_id: &str) -> Self {
        Self(format!("{}.{}", object_id, tenant_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub enum GrantOrigin {
    ServicePrincipal,
    UserDelegated {
        id_token: Option<UserAssertion>,
        account: Option<AccountId>,
    },
    Application,
    OnBehalfOf,
}

impl GrantOrigin {
    pub fn label(&self) -> &'static str {
        match self {
            GrantOrigin::ServicePrincipal => "service_principal",
            GrantOrigin::UserDelegated { .. } => "user_delegated",
            GrantOrigin::Application => "application",
            GrantOrigin::OnBehalfOf => "on_behalf_of",
        }
    }
}

/// Resource-scoped bearer credential with a bounded lifetime.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    access_token: Secret<String>,
    expires_in: u64,
    acquired_at: DateTime<Utc>,
    scope: Scope,
    origin: GrantOrigin,
}

impl TokenGrant {
    pub fn new(
        access_token: impl Into<String>,
        expires_in: u64,
        acquired_at: DateTime<Utc>,
        scope: Scope,
        origin: GrantOrigin,
    ) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            expires_in,
            acquired_at,
            scope,
            origin,
        }
    }

    pub fn bearer(&self) -> &str {
        self.access_token.expose_secret()
    }

    pub fn expires_in(&self) -> u64 {
        self.expires_in
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + Duration::seconds(self.expires_in as i64)
    }

    /// True once `now` is within `skew` of expiry.
    pub fn is_expired_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now + skew >= self.expires_at()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn is_scoped_to(&self, scope: &Scope) -> bool {
        &self.scope == scope
    }

    pub fn origin(&self) -> &GrantOrigin {
        &self.origin
    }

    /// Identity token returned alongside a user-delegated grant.
    pub fn id_token(&self) -> Option<&UserAssertion> {
        match &self.origin {
            GrantOrigin::UserDelegated { id_token, .. } => id_token.as_ref(),
            _ => None,
        }
    }

    pub fn account(&self) -> Option<&AccountId> {
        match &self.origin {
            GrantOrigin::UserDelegated { account, .. } => account.as_ref(),
            _ => None,
        }
    }

    /// The access token itself, usable as an on-behalf-of subject when the
    /// grant's audience is this application.
    pub fn as_assertion(&self) -> UserAssertion {
        UserAssertion::new(self.bearer().to_string())
    }
}
