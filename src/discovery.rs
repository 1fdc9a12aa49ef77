//! OIDC discovery and JWKS endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::error::{ErrorKind, OidcError};
use crate::keys::JsonWebKeySet;
use crate::provider::Provider;

/// OpenID Connect discovery document. All supported values are fixed; the
/// provider implements exactly one flavor of each.
#[derive(Debug, Serialize)]
pub struct DiscoveryDocument {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: String,
    jwks_uri: String,
    response_types_supported: Vec<&'static str>,
    subject_types_supported: Vec<&'static str>,
    id_token_signing_alg_values_supported: Vec<&'static str>,
    code_challenge_methods_supported: Vec<&'static str>,
    scopes_supported: Vec<&'static str>,
    grant_types_supported: Vec<&'static str>,
}

/// `GET /oidc/.well-known/openid-configuration`
pub(crate) async fn configuration(State(provider): State<Arc<Provider>>) -> Json<DiscoveryDocument> {
    let issuer = provider.issuer();
    Json(DiscoveryDocument {
        authorization_endpoint: format!("{issuer}/authorize"),
        token_endpoint: format!("{issuer}/token"),
        userinfo_endpoint: format!("{issuer}/userinfo"),
        jwks_uri: format!("{issuer}/.well-known/jwks.json"),
        issuer,
        response_types_supported: vec!["code"],
        subject_types_supported: vec!["public"],
        id_token_signing_alg_values_supported: vec!["RS256"],
        code_challenge_methods_supported: vec!["S256"],
        scopes_supported: vec!["openid", "profile", "offline_access"],
        grant_types_supported: vec!["authorization_code", "refresh_token"],
    })
}

/// `GET /oidc/.well-known/jwks.json`
pub(crate) async fn jwks(
    State(provider): State<Arc<Provider>>,
) -> Result<Json<JsonWebKeySet>, OidcError> {
    match provider.keys.jwks().await {
        Ok(set) => Ok(Json(set)),
        Err(e) => {
            error!(error = %e, "failed to render JWKS");
            Err(OidcError::new(
                ErrorKind::ServerError,
                "failed to render key set",
            ))
        }
    }
}
