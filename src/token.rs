//! The token endpoint.
//!
//! Supports the `authorization_code` and `refresh_token` grants. Both
//! funnel into one issuance path that re-validates the bound platform
//! session token, the owning user, and the external auth provider before
//! signing anything. A refresh token is therefore only as alive as the
//! platform session it is pinned to by hash.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, error, warn};

use crate::directory::{OidcClient, SessionToken};
use crate::error::{ErrorKind, OidcError};
use crate::lifecycle::{SECRET_KEY_PREFIX, SECRET_USED_AT_PREFIX};
use crate::provider::{ClientLookupError, Provider};
use crate::session::SessionError;

/// Label key prefix marking a session token as backing refresh tokens for
/// a client. The client's resource name completes the key.
pub const TOKEN_LABEL_PREFIX: &str = "oidc.management.io/client-";
/// Value of the per-client token label.
pub const TOKEN_LABEL_VALUE: &str = "true";

/// Group principal prefix the platform uses for its built-in provider;
/// stripped before groups enter claims.
const LOCAL_PRINCIPAL_PREFIX: &str = "local://";

/// Token request form body. All fields optional at the parsing layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    /// `authorization_code` or `refresh_token`.
    pub grant_type: Option<String>,
    /// Authorization code (code grant).
    pub code: Option<String>,
    /// Client ID, unless sent via HTTP Basic.
    pub client_id: Option<String>,
    /// Client secret, unless sent via HTTP Basic.
    pub client_secret: Option<String>,
    /// PKCE verifier (code grant).
    pub code_verifier: Option<String>,
    /// Refresh token (refresh grant).
    pub refresh_token: Option<String>,
}

/// Successful token response per RFC 6749 §5.1.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Signed OIDC ID token.
    pub id_token: String,
    /// Signed access token for the userinfo endpoint.
    pub access_token: String,
    /// Present only when `offline_access` was granted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    /// Always `Bearer`.
    pub token_type: String,
}

#[derive(Debug, Serialize)]
struct IdClaims {
    aud: Vec<String>,
    exp: i64,
    iat: i64,
    iss: String,
    sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    groups: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_provider: Option<String>,
}

#[derive(Debug, Serialize)]
struct AccessClaims {
    aud: Vec<String>,
    exp: i64,
    iat: i64,
    iss: String,
    sub: String,
    scope: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_provider: Option<String>,
}

/// Refresh token claims. The `session_token_hash` pins the token to the
/// platform session it was issued against.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RefreshClaims {
    aud: Vec<String>,
    exp: i64,
    iat: i64,
    sub: String,
    scope: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_provider: Option<String>,
    session_token_hash: String,
}

/// `POST /oidc/token`
pub(crate) async fn token(
    State(provider): State<Arc<Provider>>,
    headers: HeaderMap,
    Form(request): Form<TokenRequest>,
) -> Response {
    match issue(&provider, &headers, request).await {
        // Token responses carry credentials; forbid caching per RFC 6749 §5.1.
        Ok(response) => (
            [
                (header::CACHE_CONTROL, "no-store"),
                (header::PRAGMA, "no-cache"),
            ],
            Json(response),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

/// A token-issuance pathway, parsed from the request before any
/// validation runs.
#[derive(Debug)]
enum Grant {
    AuthorizationCode {
        code: String,
        client_id: Option<String>,
        client_secret: Option<String>,
        code_verifier: String,
    },
    RefreshToken {
        refresh_token: String,
    },
}

impl Grant {
    fn parse(headers: &HeaderMap, request: TokenRequest) -> Result<Self, OidcError> {
        match request.grant_type.as_deref() {
            Some("authorization_code") => {
                let (client_id, client_secret) = client_credentials(headers, &request);
                let Some(code) = request.code.filter(|c| !c.is_empty()) else {
                    return Err(OidcError::new(ErrorKind::InvalidRequest, "invalid code"));
                };
                Ok(Self::AuthorizationCode {
                    code,
                    client_id,
                    client_secret,
                    code_verifier: request.code_verifier.unwrap_or_default(),
                })
            }
            Some("refresh_token") => {
                let Some(refresh_token) = request.refresh_token.filter(|t| !t.is_empty()) else {
                    return Err(OidcError::new(
                        ErrorKind::InvalidRequest,
                        "refresh_token is required",
                    ));
                };
                Ok(Self::RefreshToken { refresh_token })
            }
            _ => Err(OidcError::new(
                ErrorKind::InvalidRequest,
                "grant_type not supported",
            )),
        }
    }
}

async fn issue(
    provider: &Provider,
    headers: &HeaderMap,
    request: TokenRequest,
) -> Result<TokenResponse, OidcError> {
    match Grant::parse(headers, request)? {
        Grant::AuthorizationCode {
            code,
            client_id,
            client_secret,
            code_verifier,
        } => {
            authorization_code_grant(
                provider,
                &code,
                client_id.as_deref(),
                client_secret.as_deref(),
                &code_verifier,
            )
            .await
        }
        Grant::RefreshToken { refresh_token } => {
            refresh_token_grant(provider, &refresh_token).await
        }
    }
}

async fn authorization_code_grant(
    provider: &Provider,
    code: &str,
    client_id: Option<&str>,
    client_secret: Option<&str>,
    code_verifier: &str,
) -> Result<TokenResponse, OidcError> {
    let session = match provider.sessions.get(code).await {
        Ok(session) => session,
        Err(SessionError::InvalidCode) => {
            return Err(OidcError::new(ErrorKind::InvalidRequest, "invalid code"));
        }
        Err(SessionError::Expired) => {
            return Err(OidcError::new(
                ErrorKind::InvalidRequest,
                "the code has expired",
            ));
        }
        Err(e) => {
            error!(error = %e, "failed to retrieve authorization session");
            return Err(OidcError::new(
                ErrorKind::ServerError,
                "error retrieving session",
            ));
        }
    };

    if client_id != Some(session.client_id.as_str()) {
        return Err(OidcError::new(
            ErrorKind::InvalidRequest,
            "invalid client_id",
        ));
    }
    let client = match provider.find_client(&session.client_id).await {
        Ok(client) => client,
        Err(ClientLookupError::NotFound) => {
            return Err(OidcError::new(
                ErrorKind::InvalidRequest,
                "invalid client_id",
            ));
        }
        Err(e) => {
            error!(client_id = %session.client_id, error = %e, "client lookup failed");
            return Err(OidcError::new(
                ErrorKind::ServerError,
                "failed to get OIDC client",
            ));
        }
    };

    verify_client_secret(provider, &client, client_secret).await?;

    // PKCE proof binds the redeeming party to the authorizing one.
    let computed = URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()));
    if computed != session.code_challenge {
        return Err(OidcError::new(
            ErrorKind::InvalidRequest,
            "failed to verify PKCE code challenge",
        ));
    }

    let token = match provider.users.get_session_token(&session.token_name).await {
        Ok(token) => token,
        Err(e) if e.is_not_found() => {
            return Err(OidcError::new(
                ErrorKind::InvalidRequest,
                "session token is no longer valid",
            ));
        }
        Err(e) => {
            error!(error = %e, "failed to get session token");
            return Err(OidcError::new(
                ErrorKind::ServerError,
                "failed to get session token",
            ));
        }
    };

    let response = mint_tokens(
        provider,
        &client,
        &token,
        session.scope.clone(),
        Some(session.nonce.as_str()).filter(|n| !n.is_empty()),
    )
    .await?;

    // The code is single-use. A failed delete leaves the record for the
    // sweep; it must not fail the grant.
    if let Err(e) = provider.sessions.remove(code).await {
        if !e.is_not_found() {
            warn!(error = %e, "failed to remove redeemed session");
        }
    }
    Ok(response)
}

async fn refresh_token_grant(
    provider: &Provider,
    refresh_token: &str,
) -> Result<TokenResponse, OidcError> {
    let header = decode_header(refresh_token).map_err(|e| {
        debug!(error = %e, "unparseable refresh token header");
        OidcError::new(ErrorKind::ServerError, "failed to parse refresh token")
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
        error!(kid, error = %e, "failed to resolve refresh token key");
        OidcError::new(ErrorKind::ServerError, "failed to parse refresh token")
    })?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_aud = false;
    let claims = decode::<RefreshClaims>(refresh_token, &decoding_key, &validation)
        .map_err(|e| {
            debug!(error = %e, "refresh token verification failed");
            OidcError::new(ErrorKind::ServerError, "failed to parse refresh token")
        })?
        .claims;

    // The refresh token is only honored while the platform session it was
    // issued against still exists.
    let tokens = provider
        .users
        .list_session_tokens(&claims.sub)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to list session tokens");
            OidcError::new(ErrorKind::ServerError, "failed to list session tokens")
        })?;
    let Some(token) = tokens
        .into_iter()
        .find(|t| hex::encode(Sha256::digest(t.name.as_bytes())) == claims.session_token_hash)
    else {
        return Err(OidcError::new(
            ErrorKind::AccessDenied,
            "session token no longer present",
        ));
    };

    let Some(client_id) = claims.aud.first() else {
        return Err(OidcError::new(
            ErrorKind::ServerError,
            "can't find client in audience",
        ));
    };
    let client = provider.find_client(client_id).await.map_err(|e| {
        error!(client_id, error = %e, "client lookup failed");
        OidcError::new(ErrorKind::ServerError, "failed to get OIDC client")
    })?;

    mint_tokens(provider, &client, &token, claims.scope, None).await
}

/// The shared issuance path. Re-validates session token, user, and auth
/// provider state, then signs the ID/access (and optionally refresh)
/// tokens.
async fn mint_tokens(
    provider: &Provider,
    client: &OidcClient,
    token: &SessionToken,
    scope: Vec<String>,
    nonce: Option<&str>,
) -> Result<TokenResponse, OidcError> {
    if token.is_expired() {
        return Err(OidcError::new(
            ErrorKind::AccessDenied,
            "session token has expired",
        ));
    }
    if !token.enabled {
        return Err(OidcError::new(
            ErrorKind::AccessDenied,
            "session token is disabled",
        ));
    }
    if let Some(auth_provider) = &token.auth_provider {
        let disabled = provider
            .users
            .is_auth_provider_disabled(auth_provider)
            .await
            .map_err(|e| {
                error!(auth_provider, error = %e, "auth provider check failed");
                OidcError::new(
                    ErrorKind::ServerError,
                    "can't check if auth provider is disabled",
                )
            })?;
        if disabled {
            return Err(OidcError::new(
                ErrorKind::AccessDenied,
                "auth provider is disabled",
            ));
        }
    }

    let user = provider.users.get_user(&token.user_id).await.map_err(|e| {
        error!(user_id = %token.user_id, error = %e, "user lookup failed");
        OidcError::new(ErrorKind::ServerError, "can't get user")
    })?;
    if !user.enabled {
        return Err(OidcError::new(ErrorKind::AccessDenied, "user is disabled"));
    }

    let groups = match provider.users.get_user_attributes(&user.id).await {
        Ok(attributes) => attributes
            .group_principals
            .into_values()
            .flatten()
            .map(|g| g.trim_start_matches(LOCAL_PRINCIPAL_PREFIX).to_string())
            .collect(),
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => {
            error!(user_id = %user.id, error = %e, "attribute lookup failed");
            return Err(OidcError::new(
                ErrorKind::ServerError,
                "can't get user attributes",
            ));
        }
    };

    let (encoding_key, kid) = provider.keys.signing_key().await.map_err(|e| {
        error!(error = %e, "signing key unavailable");
        OidcError::new(ErrorKind::ServerError, "failed to get signing key")
    })?;
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid);

    let now = Utc::now().timestamp();
    let expires_in = client.spec.token_expiration_seconds;
    let aud = vec![client.status.client_id.clone()];
    let issuer = provider.issuer();

    let id_claims = IdClaims {
        aud: aud.clone(),
        exp: now + expires_in,
        iat: now,
        iss: issuer.clone(),
        sub: user.id.clone(),
        preferred_username: scope
            .iter()
            .any(|s| s == "profile")
            .then(|| user.display_name.clone()),
        nonce: nonce.map(ToString::to_string),
        groups,
        auth_provider: token.auth_provider.clone(),
    };
    let access_claims = AccessClaims {
        aud: aud.clone(),
        exp: now + expires_in,
        iat: now,
        iss: issuer,
        sub: user.id.clone(),
        scope: scope.clone(),
        auth_provider: token.auth_provider.clone(),
    };

    let refresh_token = if scope.iter().any(|s| s == "offline_access") {
        let refresh_claims = RefreshClaims {
            aud,
            exp: now + client.spec.refresh_token_expiration_seconds,
            iat: now,
            sub: user.id,
            scope,
            auth_provider: token.auth_provider.clone(),
            session_token_hash: hex::encode(Sha256::digest(token.name.as_bytes())),
        };

        // Label the platform session so revocation can be keyed by client.
        provider
            .users
            .label_session_token(
                &token.name,
                &format!("{TOKEN_LABEL_PREFIX}{}", client.name),
                TOKEN_LABEL_VALUE,
            )
            .await
            .map_err(|e| {
                error!(token = %token.name, error = %e, "failed to label session token");
                OidcError::new(ErrorKind::ServerError, "failed to label session token")
            })?;

        Some(sign(&header, &refresh_claims, &encoding_key)?)
    } else {
        None
    };

    Ok(TokenResponse {
        id_token: sign(&header, &id_claims, &encoding_key)?,
        access_token: sign(&header, &access_claims, &encoding_key)?,
        refresh_token,
        expires_in,
        token_type: "Bearer".to_string(),
    })
}

/// Verify the presented client secret against every active secret of the
/// client, in constant time per candidate, and stamp the matching secret's
/// used-at annotation.
async fn verify_client_secret(
    provider: &Provider,
    client: &OidcClient,
    presented: Option<&str>,
) -> Result<(), OidcError> {
    let Some(presented) = presented.filter(|s| !s.is_empty()) else {
        return Err(OidcError::new(
            ErrorKind::InvalidRequest,
            "invalid client_secret",
        ));
    };

    let record = provider
        .store
        .get(
            &provider.config.namespaces.client_secrets,
            &client.status.client_id,
        )
        .await
        .map_err(|e| {
            error!(client = %client.name, error = %e, "failed to get client secret record");
            OidcError::new(ErrorKind::ServerError, "failed to get client secret")
        })?;

    for (key, stored) in &record.data {
        if !key.starts_with(SECRET_KEY_PREFIX) {
            continue;
        }
        if stored.ct_eq(presented.as_bytes()).into() {
            // Used-at stamping is observability, not part of the grant.
            let stamp = Utc::now().timestamp().to_string();
            if let Err(e) = provider
                .clients
                .set_annotation(
                    &client.name,
                    &format!("{SECRET_USED_AT_PREFIX}{key}"),
                    &stamp,
                )
                .await
            {
                error!(client = %client.name, key, error = %e, "failed to stamp secret use");
            }
            return Ok(());
        }
    }

    Err(OidcError::new(
        ErrorKind::InvalidRequest,
        "invalid client_secret",
    ))
}

/// Pull client credentials from HTTP Basic auth, falling back to the form
/// body.
fn client_credentials(
    headers: &HeaderMap,
    request: &TokenRequest,
) -> (Option<String>, Option<String>) {
    if let Some(encoded) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    {
        if let Some((id, secret)) = STANDARD
            .decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|creds| {
                creds
                    .split_once(':')
                    .map(|(id, secret)| (id.to_string(), secret.to_string()))
            })
        {
            return (Some(id), Some(secret));
        }
    }
    (request.client_id.clone(), request.client_secret.clone())
}

fn sign(
    header: &Header,
    claims: &impl Serialize,
    key: &jsonwebtoken::EncodingKey,
) -> Result<String, OidcError> {
    encode(header, claims, key).map_err(|e| {
        error!(error = %e, "token signing failed");
        OidcError::new(ErrorKind::ServerError, "failed to sign token")
    })
}
