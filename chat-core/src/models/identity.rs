use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Subset of the Microsoft Graph `/me` resource the chat needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub user_principal_name: String,
}

impl UserProfile {
    pub fn is_empty(&self) -> bool {
        self.id.is_empty() && self.user_principal_name.is_empty()
    }
}

/// What the inbound request tells us about the caller.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    /// Raw client address, possibly with a port (`10.0.0.4:51234`).
    pub client_address: Option<String>,
}

impl RequestMetadata {
    pub fn new(client_address: Option<String>) -> Self {
        Self { client_address }
    }
}

/// End-user context forwarded with every completion call for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityContext {
    application_name: String,
    end_user_id: String,
    source_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_user_tenant_id: Option<String>,
}

impl SecurityContext {
    pub fn derive(
        application_name: &str,
        profile: &UserProfile,
        tenant_id: Option<&str>,
        metadata: &RequestMetadata,
    ) -> Self {
        let end_user_id = if !profile.id.is_empty() {
            profile.id.clone()
        } else if !profile.user_principal_name.is_empty() {
            profile.user_principal_name.clone()
        } else {
            "unknown".to_string()
        };

        Self {
            application_name: application_name.to_string(),
            end_user_id,
            source_ip: normalize_source_ip(metadata.client_address.as_deref()),
            end_user_tenant_id: tenant_id.map(str::to_string),
        }
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn end_user_id(&self) -> &str {
        &self.end_user_id
    }

    pub fn source_ip(&self) -> &str {
        &self.source_ip
    }

    pub fn end_user_tenant_id(&self) -> Option<&str> {
        self.end_user_tenant_id.as_deref()
    }
}

/// Strips a trailing port; `"unknown"` when no address is available.
pub fn normalize_source_ip(raw: Option<&str>) -> String {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return "unknown".to_string();
    };

    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return ip.to_string();
    }

    match raw.split_once(':') {
        Some((host, _port)) if !host.is_empty() => host.to_string(),
        _ => raw.to_string(),
    }
}
