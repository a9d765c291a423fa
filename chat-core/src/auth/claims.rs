use anyhow::Result;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Claims of an Entra ID id token (or an access token issued to this app).
#[derive(Debug, Default, Deserialize)]
pub struct IdentityClaims {
    pub oid: Option<String>,
    pub tid: Option<String>,
    pub sub: Option<String>,
    pub preferred_username: Option<String>,
    pub name: Option<String>,
    pub exp: Option<i64>,
}

/// Decode JWT claims without validation.
///
/// Tokens reach us straight from the token endpoint over TLS; we only read
/// routing data (account ids, expiry). Nothing here is an authorization
/// decision, the downstream resource validates signatures.
pub fn decode_claims<T: DeserializeOwned>(token: &str) -> Result<T> {
    let parts: Vec<&str> = token.split('.').collect();

    if parts.len() != 3 {
        return Err(anyhow::anyhow!("Invalid JWT format"));
    }

    let payload = general_purpose::URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|e| anyhow::anyhow!("Failed to decode JWT payload: {}", e))?;

    let claims: T = serde_json::from_slice(&payload)
        .map_err(|e| anyhow::anyhow!("Failed to parse JWT claims: {}", e))?;

    Ok(claims)
}

/// `exp` of a JWT, if it can be read.
pub fn expires_at(token: &str) -> Option<DateTime<Utc>> {
    let claims: IdentityClaims = decode_claims(token).ok()?;
    claims
        .exp
        .and_then(|exp| Utc.timestamp_opt(exp, 0).single())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(claims: serde_json::Value) -> String {
        let header = general_purpose::URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = general_purpose::URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{}.{}.signature", header, payload)
    }

    #[test]
    fn test_decode_identity_claims() {
        let token = encode(serde_json::json!({
            "oid": "00000000-0000-0000-0000-000000000001",
            "tid": "tenant-1",
            "preferred_username": "ada@contoso.com",
            "exp": 9999999999i64
        }));

        let claims: IdentityClaims = decode_claims(&token).unwrap();
        assert_eq!(claims.oid.as_deref(), Some("00000000-0000-0000-0000-000000000001"));
        assert_eq!(claims.tid.as_deref(), Some("tenant-1"));
        assert_eq!(claims.preferred_username.as_deref(), Some("ada@contoso.com"));
    }

    #[test]
    fn test_expires_at() {
        let token = encode(serde_json::json!({ "exp": 1_700_000_000i64 }));
        assert_eq!(expires_at(&token).unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_rejects_opaque_tokens() {
        assert!(decode_claims::<IdentityClaims>("not-a-jwt").is_err());
        assert!(expires_at("a.b").is_none());
    }
}
