//! The authorization endpoint.
//!
//! Validates an incoming OIDC authorization request, binds it to the
//! caller's platform session, and mints an authorization-code session.
//!
//! # Error reporting
//!
//! Failures discovered before the `redirect_uri` is validated are returned
//! as direct `400` JSON bodies — there is no safe place to redirect to.
//! Once the `redirect_uri` is known to be registered for the client, all
//! further protocol errors travel back to the client application as
//! `error`/`error_description` query parameters (plus `state` when the
//! request carried one).
//!
//! # Timing
//!
//! Platform-session lookups are time-normalized: a dummy constant-time
//! comparison runs even when no token with the presented name exists, so
//! "no such token" and "wrong secret" are not distinguishable by latency.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, error, warn};
use url::Url;

use crate::directory::DirectoryError;
use crate::error::{ErrorKind, OidcError};
use crate::generator;
use crate::provider::{ClientLookupError, Provider};
use crate::session::Session;

/// Scopes this provider grants.
pub const SUPPORTED_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// Compared against when no stored secret exists, to normalize timing.
const DUMMY_SECRET: &str = "dummy-comparison-value";

/// Authorization request parameters, accepted via GET query or POST form.
///
/// Everything is optional at the parsing layer so that missing parameters
/// surface as protocol errors rather than rejections from the extractor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeRequest {
    /// Registered client's assigned ID.
    pub client_id: Option<String>,
    /// Must be `code`.
    pub response_type: Option<String>,
    /// Space-separated scopes.
    pub scope: Option<String>,
    /// PKCE S256 challenge.
    pub code_challenge: Option<String>,
    /// Must be `S256`.
    pub code_challenge_method: Option<String>,
    /// OIDC nonce, echoed into the ID token.
    pub nonce: Option<String>,
    /// Opaque client-side CSRF correlation value.
    pub state: Option<String>,
    /// Callback the browser is sent back to.
    pub redirect_uri: Option<String>,
}

/// The tagged result of evaluating an authorization request.
#[derive(Debug)]
pub(crate) enum AuthorizeOutcome {
    /// No valid platform session; send the browser to login with the
    /// original parameters preserved.
    LoginRedirect(Url),
    /// Success; `location` carries the code (and `state` if supplied).
    Redirect {
        /// Callback URL with `code`/`state` attached.
        location: Url,
        /// The validated redirect URI, echoed as the CORS origin.
        allow_origin: String,
    },
    /// Protocol error after the redirect target was validated.
    ErrorRedirect {
        /// Callback URL with `error`/`error_description`/`state` attached.
        location: Url,
        /// The validated redirect URI, echoed as the CORS origin.
        allow_origin: String,
    },
    /// Structural failure with no safe redirect target.
    DirectError(OidcError),
}

impl AuthorizeOutcome {
    fn into_response(self) -> Response {
        match self {
            Self::LoginRedirect(location) => found(&location),
            Self::Redirect {
                location,
                allow_origin,
            }
            | Self::ErrorRedirect {
                location,
                allow_origin,
            } => {
                let mut response = found(&location);
                // Overrides any default set by outer middleware.
                if let Ok(value) = HeaderValue::from_str(&allow_origin) {
                    response
                        .headers_mut()
                        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
                }
                response
            }
            Self::DirectError(err) => err.into_response(),
        }
    }
}

/// `GET /oidc/authorize`
pub(crate) async fn authorize_query(
    State(provider): State<Arc<Provider>>,
    headers: HeaderMap,
    Query(request): Query<AuthorizeRequest>,
) -> Response {
    evaluate(&provider, &headers, request).await.into_response()
}

/// `POST /oidc/authorize`
pub(crate) async fn authorize_form(
    State(provider): State<Arc<Provider>>,
    headers: HeaderMap,
    Form(request): Form<AuthorizeRequest>,
) -> Response {
    evaluate(&provider, &headers, request).await.into_response()
}

async fn evaluate(
    provider: &Provider,
    headers: &HeaderMap,
    request: AuthorizeRequest,
) -> AuthorizeOutcome {
    // 1. Resolve the caller's platform session.
    let token_name = match resolve_platform_session(provider, headers).await {
        SessionResolution::Valid(name) => name,
        SessionResolution::Missing => {
            debug!("no valid platform session; redirecting to login");
            return match login_url(provider, &request) {
                Ok(url) => AuthorizeOutcome::LoginRedirect(url),
                Err(outcome) => outcome,
            };
        }
        SessionResolution::Error(e) => {
            error!(error = %e, "failed to resolve platform session");
            return AuthorizeOutcome::DirectError(OidcError::new(
                ErrorKind::ServerError,
                "failed to resolve platform session",
            ));
        }
    };

    // 2. Structural redirect_uri checks; without a trusted target, errors
    //    are reported directly.
    let Some(redirect_raw) = request.redirect_uri.as_deref().filter(|s| !s.is_empty()) else {
        return AuthorizeOutcome::DirectError(OidcError::new(
            ErrorKind::InvalidRequest,
            "redirect_uri is required",
        ));
    };
    let Ok(redirect_uri) = Url::parse(redirect_raw) else {
        return AuthorizeOutcome::DirectError(OidcError::new(
            ErrorKind::InvalidRequest,
            "redirect_uri is not a valid URL",
        ));
    };
    let authorize_endpoint = format!("{}/authorize", provider.issuer());
    if redirect_raw.trim_end_matches('/') == authorize_endpoint {
        return AuthorizeOutcome::DirectError(OidcError::new(
            ErrorKind::InvalidRequest,
            "redirect_uri cannot be the authorize endpoint",
        ));
    }

    // 3. Resolve the client.
    let Some(client_id) = request.client_id.as_deref().filter(|s| !s.is_empty()) else {
        return AuthorizeOutcome::DirectError(OidcError::new(
            ErrorKind::InvalidRequest,
            "client_id is required",
        ));
    };
    let client = match provider.find_client(client_id).await {
        Ok(client) => client,
        Err(ClientLookupError::NotFound) => {
            warn!(client_id, "authorization request for unknown client");
            return AuthorizeOutcome::DirectError(OidcError::new(
                ErrorKind::InvalidRequest,
                "unknown client_id",
            ));
        }
        Err(ClientLookupError::Ambiguous(n)) => {
            error!(client_id, count = n, "client_id is not unique");
            return AuthorizeOutcome::DirectError(OidcError::new(
                ErrorKind::ServerError,
                "client_id is not unique",
            ));
        }
        Err(ClientLookupError::Directory(e)) => {
            error!(client_id, error = %e, "client lookup failed");
            return AuthorizeOutcome::DirectError(OidcError::new(
                ErrorKind::ServerError,
                "failed to look up client",
            ));
        }
    };

    // 4. The redirect URI must exactly match a registered one.
    if !client.spec.redirect_uris.iter().any(|u| u == redirect_raw) {
        warn!(client_id, redirect_uri = redirect_raw, "unregistered redirect_uri");
        return AuthorizeOutcome::DirectError(OidcError::new(
            ErrorKind::InvalidRequest,
            "redirect_uri is not registered for this client",
        ));
    }
    let allow_origin = redirect_raw.to_string();
    let state = request.state.as_deref().filter(|s| !s.is_empty());

    // 5–6. Protocol rules; from here errors redirect back to the client.
    if request.response_type.as_deref() != Some("code") {
        return error_redirect(
            &redirect_uri,
            allow_origin,
            ErrorKind::UnsupportedResponseType,
            "only the code response type is supported",
            state,
        );
    }
    if request.code_challenge_method.as_deref() != Some("S256") {
        return error_redirect(
            &redirect_uri,
            allow_origin,
            ErrorKind::InvalidRequest,
            "only the S256 code challenge method is supported",
            state,
        );
    }
    let scopes: Vec<String> = request
        .scope
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(ToString::to_string)
        .collect();
    if !scopes.iter().any(|s| s == "openid")
        || !scopes.iter().all(|s| SUPPORTED_SCOPES.contains(&s.as_str()))
    {
        return error_redirect(
            &redirect_uri,
            allow_origin,
            ErrorKind::InvalidScope,
            "scope must include openid and contain only openid, profile and offline_access",
            state,
        );
    }
    let Some(code_challenge) = request
        .code_challenge
        .as_deref()
        .filter(|s| !s.is_empty())
    else {
        return error_redirect(
            &redirect_uri,
            allow_origin,
            ErrorKind::InvalidRequest,
            "code_challenge is required",
            state,
        );
    };

    // 7. Mint the code and persist the session.
    let code = match generator::generate_code() {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "failed to generate authorization code");
            return error_redirect(
                &redirect_uri,
                allow_origin,
                ErrorKind::ServerError,
                "failed to generate authorization code",
                state,
            );
        }
    };
    let session = Session {
        client_id: client_id.to_string(),
        token_name,
        scope: scopes,
        code_challenge: code_challenge.to_string(),
        nonce: request.nonce.clone().unwrap_or_default(),
        created_at: Utc::now(),
    };
    if let Err(e) = provider.sessions.add(&code, &session).await {
        error!(error = %e, "failed to store authorization session");
        return error_redirect(
            &redirect_uri,
            allow_origin,
            ErrorKind::ServerError,
            "failed to store authorization session",
            state,
        );
    }

    // 8. Send the browser back with the code.
    let mut location = redirect_uri;
    {
        let mut pairs = location.query_pairs_mut();
        pairs.append_pair("code", &code);
        if let Some(state) = state {
            pairs.append_pair("state", state);
        }
    }
    AuthorizeOutcome::Redirect {
        location,
        allow_origin,
    }
}

enum SessionResolution {
    Valid(String),
    Missing,
    Error(DirectoryError),
}

/// Resolve and verify the platform session bound to this request.
async fn resolve_platform_session(provider: &Provider, headers: &HeaderMap) -> SessionResolution {
    let Some(credential) = extract_credential(headers, &provider.config.auth.cookie_name) else {
        return SessionResolution::Missing;
    };
    let Some((name, secret)) = credential.split_once(':') else {
        // Still burn a comparison so malformed credentials are not faster.
        let _ = verify_secret(DUMMY_SECRET, &credential);
        return SessionResolution::Missing;
    };

    match provider.users.get_session_token(name).await {
        Ok(token) => {
            let secret_ok = verify_secret(&token.secret, secret);
            if secret_ok && token.enabled && !token.is_expired() {
                SessionResolution::Valid(token.name)
            } else {
                SessionResolution::Missing
            }
        }
        Err(e) if e.is_not_found() => {
            // Dummy comparison on the not-found path keeps its timing in
            // line with the token-found path.
            let _ = verify_secret(DUMMY_SECRET, secret);
            SessionResolution::Missing
        }
        Err(e) => SessionResolution::Error(e),
    }
}

/// Constant-time comparison over SHA-256 digests of both sides.
fn verify_secret(expected: &str, provided: &str) -> bool {
    let expected = Sha256::digest(expected.as_bytes());
    let provided = Sha256::digest(provided.as_bytes());
    expected.ct_eq(&provided).into()
}

/// Pull the platform session credential from the configured cookie or an
/// `Authorization: Bearer` header.
fn extract_credential(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    if let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for cookie in cookies.split(';') {
            if let Some((name, value)) = cookie.trim().split_once('=') {
                if name == cookie_name && !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(ToString::to_string)
}

/// Build the login URL with every original OIDC parameter re-attached so
/// the flow can resume after login.
fn login_url(
    provider: &Provider,
    request: &AuthorizeRequest,
) -> Result<Url, AuthorizeOutcome> {
    let raw = format!(
        "{}{}",
        provider.config.issuer, provider.config.auth.login_path
    );
    let mut url = Url::parse(&raw).map_err(|e| {
        error!(url = raw, error = %e, "misconfigured login URL");
        AuthorizeOutcome::DirectError(OidcError::new(
            ErrorKind::ServerError,
            "login redirect is misconfigured",
        ))
    })?;

    {
        let mut pairs = url.query_pairs_mut();
        let params = [
            ("client_id", &request.client_id),
            ("response_type", &request.response_type),
            ("scope", &request.scope),
            ("code_challenge", &request.code_challenge),
            ("code_challenge_method", &request.code_challenge_method),
            ("nonce", &request.nonce),
            ("state", &request.state),
            ("redirect_uri", &request.redirect_uri),
        ];
        for (key, value) in params {
            if let Some(value) = value {
                pairs.append_pair(key, value);
            }
        }
    }
    Ok(url)
}

fn error_redirect(
    redirect_uri: &Url,
    allow_origin: String,
    kind: ErrorKind,
    description: &str,
    state: Option<&str>,
) -> AuthorizeOutcome {
    let mut location = redirect_uri.clone();
    {
        let mut pairs = location.query_pairs_mut();
        pairs.append_pair("error", kind.as_str());
        pairs.append_pair("error_description", description);
        if let Some(state) = state {
            pairs.append_pair("state", state);
        }
    }
    AuthorizeOutcome::ErrorRedirect {
        location,
        allow_origin,
    }
}

/// 302 Found redirect.
fn found(location: &Url) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::directory::{
        InMemoryClientDirectory, InMemoryUserDirectory, OidcClient, OidcClientSpec,
        OidcClientStatus, SessionToken,
    };
    use crate::store::InMemoryObjectStore;
    use std::collections::BTreeMap;

    const CALLBACK: &str = "https://cb.example.com/callback";

    fn test_provider() -> Provider {
        let mut config = ProviderConfig {
            issuer: "https://platform.example.com".to_string(),
            ..ProviderConfig::default()
        };
        config.session.retry.min_delay_ms = 0;
        config.session.retry.max_delay_ms = 0;

        let clients = InMemoryClientDirectory::new();
        clients.insert(OidcClient {
            name: "app".to_string(),
            spec: OidcClientSpec {
                redirect_uris: vec![CALLBACK.to_string()],
                token_expiration_seconds: 3600,
                refresh_token_expiration_seconds: 86400,
            },
            status: OidcClientStatus {
                client_id: "client-abc123".to_string(),
            },
            annotations: BTreeMap::new(),
        });

        let users = InMemoryUserDirectory::new();
        users.insert_token(SessionToken {
            name: "token-1".to_string(),
            secret: "sekret".to_string(),
            user_id: "u-1".to_string(),
            auth_provider: None,
            enabled: true,
            expires_at: None,
            labels: BTreeMap::new(),
        });

        Provider::new(
            config,
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(clients),
            Arc::new(users),
        )
    }

    fn session_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("platform_session=token-1:sekret"),
        );
        headers
    }

    fn valid_request() -> AuthorizeRequest {
        AuthorizeRequest {
            client_id: Some("client-abc123".to_string()),
            response_type: Some("code".to_string()),
            scope: Some("openid".to_string()),
            code_challenge: Some("challenge".to_string()),
            code_challenge_method: Some("S256".to_string()),
            nonce: None,
            state: Some("xyz".to_string()),
            redirect_uri: Some(CALLBACK.to_string()),
        }
    }

    fn query_params(url: &Url) -> BTreeMap<String, String> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[tokio::test]
    async fn happy_path_redirects_with_code_and_state() {
        let provider = test_provider();
        let outcome = evaluate(&provider, &session_headers(), valid_request()).await;

        let AuthorizeOutcome::Redirect {
            location,
            allow_origin,
        } = outcome
        else {
            panic!("expected success redirect, got {outcome:?}");
        };
        assert_eq!(allow_origin, CALLBACK);

        let params = query_params(&location);
        assert!(params["code"].starts_with("code-"));
        assert_eq!(params["state"], "xyz");

        // The session must be retrievable under that code.
        let session = provider.sessions.get(&params["code"]).await.unwrap();
        assert_eq!(session.client_id, "client-abc123");
        assert_eq!(session.token_name, "token-1");
    }

    #[tokio::test]
    async fn missing_session_redirects_to_login_with_params() {
        let provider = test_provider();
        let outcome = evaluate(&provider, &HeaderMap::new(), valid_request()).await;

        let AuthorizeOutcome::LoginRedirect(location) = outcome else {
            panic!("expected login redirect, got {outcome:?}");
        };
        assert_eq!(location.path(), "/login");
        let params = query_params(&location);
        assert_eq!(params["client_id"], "client-abc123");
        assert_eq!(params["redirect_uri"], CALLBACK);
        assert_eq!(params["state"], "xyz");
    }

    #[tokio::test]
    async fn wrong_token_secret_redirects_to_login() {
        let provider = test_provider();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("platform_session=token-1:wrong"),
        );
        let outcome = evaluate(&provider, &headers, valid_request()).await;
        assert!(matches!(outcome, AuthorizeOutcome::LoginRedirect(_)));
    }

    #[tokio::test]
    async fn plain_challenge_method_is_rejected_via_redirect() {
        let provider = test_provider();
        let mut request = valid_request();
        request.code_challenge_method = Some("plain".to_string());
        let outcome = evaluate(&provider, &session_headers(), request).await;

        let AuthorizeOutcome::ErrorRedirect { location, .. } = outcome else {
            panic!("expected error redirect, got {outcome:?}");
        };
        let params = query_params(&location);
        assert_eq!(params["error"], "invalid_request");
        assert!(params["error_description"].contains("S256"));
        assert_eq!(params["state"], "xyz");
    }

    #[tokio::test]
    async fn unknown_scope_is_invalid_scope() {
        let provider = test_provider();
        let mut request = valid_request();
        request.scope = Some("openid email".to_string());
        let outcome = evaluate(&provider, &session_headers(), request).await;

        let AuthorizeOutcome::ErrorRedirect { location, .. } = outcome else {
            panic!("expected error redirect, got {outcome:?}");
        };
        assert_eq!(query_params(&location)["error"], "invalid_scope");
    }

    #[tokio::test]
    async fn missing_openid_scope_is_invalid_scope() {
        let provider = test_provider();
        let mut request = valid_request();
        request.scope = Some("profile".to_string());
        let outcome = evaluate(&provider, &session_headers(), request).await;
        assert!(matches!(outcome, AuthorizeOutcome::ErrorRedirect { .. }));
    }

    #[tokio::test]
    async fn unregistered_redirect_uri_is_a_direct_error() {
        let provider = test_provider();
        let mut request = valid_request();
        request.redirect_uri = Some("https://evil.example.com/cb".to_string());
        let outcome = evaluate(&provider, &session_headers(), request).await;
        assert!(matches!(outcome, AuthorizeOutcome::DirectError(_)));
    }

    #[tokio::test]
    async fn missing_redirect_uri_is_a_direct_error() {
        let provider = test_provider();
        let mut request = valid_request();
        request.redirect_uri = None;
        let outcome = evaluate(&provider, &session_headers(), request).await;
        assert!(matches!(outcome, AuthorizeOutcome::DirectError(_)));
    }

    #[tokio::test]
    async fn unknown_client_is_a_direct_error() {
        let provider = test_provider();
        let mut request = valid_request();
        request.client_id = Some("client-unknown".to_string());
        let outcome = evaluate(&provider, &session_headers(), request).await;
        assert!(matches!(outcome, AuthorizeOutcome::DirectError(_)));
    }
}
