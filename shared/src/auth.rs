//! Tenant context resolution from caller identity.
//!
//! Identity is issued elsewhere. Behind API Gateway the authorizer has
//! already validated the token and hands us its claims; behind a Lambda
//! function URL (used for response streaming) there is no authorizer, so the
//! session token is verified here with the shared HS256 secret.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::TenantContext;
use crate::{Error, Result};

/// Claim carrying the caller's organization.
pub const ORGANIZATION_CLAIM: &str = "custom:organization_id";

/// Claims of a gateway session token.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (actor id)
    pub sub: String,
    /// Organization, absent for actors not yet in one
    #[serde(rename = "custom:organization_id", default)]
    pub organization_id: Option<String>,
    /// Session id
    #[serde(default)]
    pub jti: Option<String>,
    /// Expiration
    pub exp: i64,
}

fn parse_organization(raw: Option<&str>) -> Result<Option<Uuid>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(raw) => Uuid::parse_str(raw)
            .map(Some)
            .map_err(|e| Error::Auth(format!("Invalid organization claim: {}", e))),
    }
}

/// Build the tenant context from authorizer claims.
pub fn context_from_claims(claims: &Value) -> Result<TenantContext> {
    let actor_id = claims
        .get("sub")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Auth("Missing sub claim".to_string()))?;

    let organization_id = parse_organization(claims.get(ORGANIZATION_CLAIM).and_then(|v| v.as_str()))?;

    let session_id = ["jti", "event_id", "origin_jti"]
        .iter()
        .find_map(|name| claims.get(*name).and_then(|v| v.as_str()))
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Ok(TenantContext {
        actor_id: actor_id.to_string(),
        organization_id,
        session_id,
    })
}

/// Verify a bearer session token and build the tenant context from it.
pub fn context_from_token(token: &str, secret: &[u8]) -> Result<TenantContext> {
    let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();

    let validation = Validation::new(Algorithm::HS256);
    let token_data = decode::<SessionClaims>(token, &DecodingKey::from_secret(secret), &validation)
        .map_err(|e| Error::Auth(format!("Invalid session token: {}", e)))?;

    let claims = token_data.claims;
    Ok(TenantContext {
        organization_id: parse_organization(claims.organization_id.as_deref())?,
        session_id: claims.jti.unwrap_or_else(|| Uuid::new_v4().to_string()),
        actor_id: claims.sub,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    #[test]
    fn test_context_from_claims() {
        let org = Uuid::new_v4();
        let context = context_from_claims(&json!({
            "sub": "user-123",
            "custom:organization_id": org.to_string(),
            "jti": "session-9"
        }))
        .unwrap();

        assert_eq!(context.actor_id, "user-123");
        assert_eq!(context.organization_id, Some(org));
        assert_eq!(context.session_id, "session-9");
    }

    #[test]
    fn test_missing_organization_is_allowed() {
        let context = context_from_claims(&json!({ "sub": "user-123", "event_id": "e-1" })).unwrap();
        assert_eq!(context.organization_id, None);
        assert_eq!(context.session_id, "e-1");
    }

    #[test]
    fn test_missing_sub_is_auth_error() {
        let err = context_from_claims(&json!({ "custom:organization_id": Uuid::new_v4() })).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));

        let err = context_from_claims(&json!({ "sub": "u", "custom:organization_id": "not-a-uuid" })).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn test_context_from_token() {
        let org = Uuid::new_v4();
        let claims = SessionClaims {
            sub: "user-7".to_string(),
            organization_id: Some(org.to_string()),
            jti: Some("s-1".to_string()),
            exp: chrono::Utc::now().timestamp() + 600,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"shh")).unwrap();

        let context = context_from_token(&format!("Bearer {}", token), b"shh").unwrap();
        assert_eq!(context.actor_id, "user-7");
        assert_eq!(context.organization_id, Some(org));

        let err = context_from_token(&token, b"wrong").unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }
}
