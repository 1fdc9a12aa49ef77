//! The userinfo endpoint.
//!
//! Resolves claims from a bearer access token issued by the token
//! endpoint. Group memberships are returned whenever present; the display
//! name only when the token was granted the `profile` scope.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::Json;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{ErrorKind, OidcError};
use crate::provider::Provider;

#[derive(Debug, Deserialize)]
struct AccessTokenClaims {
    sub: Option<String>,
    scope: Option<Vec<String>>,
}

/// Userinfo response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct UserInfo {
    /// Subject, the platform user ID.
    pub sub: String,
    /// Display name; present only with the `profile` scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Group memberships; omitted when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

/// `GET /oidc/userinfo`
pub(crate) async fn userinfo(
    State(provider): State<Arc<Provider>>,
    headers: HeaderMap,
) -> Result<Json<UserInfo>, OidcError> {
    let Some(access_token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
    else {
        return Err(OidcError::new(
            ErrorKind::InvalidRequest,
            "access token is required",
        ));
    };

    let claims = verify_access_token(provider.as_ref(), access_token).await?;
    let Some(sub) = claims.sub.filter(|s| !s.is_empty()) else {
        return Err(OidcError::new(
            ErrorKind::InvalidRequest,
            "access token has no subject",
        ));
    };
    let Some(scope) = claims.scope.filter(|s| !s.is_empty()) else {
        return Err(OidcError::new(
            ErrorKind::InvalidRequest,
            "access token has no scope",
        ));
    };

    let username = if scope.iter().any(|s| s == "profile") {
        let user = provider.users.get_user(&sub).await.map_err(|e| {
            error!(user_id = %sub, error = %e, "user lookup failed");
            OidcError::new(ErrorKind::ServerError, "can't get user")
        })?;
        Some(user.display_name)
    } else {
        None
    };

    let groups = match provider.users.get_user_attributes(&sub).await {
        Ok(attributes) => attributes
            .group_principals
            .into_values()
            .flatten()
            .map(|g| g.trim_start_matches("local://").to_string())
            .collect(),
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => {
            error!(user_id = %sub, error = %e, "attribute lookup failed");
            return Err(OidcError::new(
                ErrorKind::ServerError,
                "can't get user attributes",
            ));
        }
    };

    Ok(Json(UserInfo {
        sub,
        username,
        groups,
    }))
}

async fn verify_access_token(
    provider: &Provider,
    access_token: &str,
) -> Result<AccessTokenClaims, OidcError> {
    let header = decode_header(access_token).map_err(|e| {
        debug!(error = %e, "unparseable access token header");
        OidcError::new(ErrorKind::ServerError, "failed to parse access token")
    })?;
    if header.alg != Algorithm::RS256 {
        return Err(OidcError::new(
            ErrorKind::ServerError,
            "unexpected signing method",
        ));
    }
    let Some(kid) = header.kid else {
        return Err(OidcError::new(ErrorKind::ServerError, "can't find kid"));
    };
    let decoding_key = provider.keys.public_key(&kid).await.map_err(|e| {
        error!(kid, error = %e, "failed to resolve access token key");
        OidcError::new(ErrorKind::ServerError, "failed to parse access token")
    })?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_aud = false;
    decode::<AccessTokenClaims>(access_token, &decoding_key, &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            debug!(error = %e, "access token verification failed");
            OidcError::new(ErrorKind::ServerError, "failed to parse access token")
        })
}
