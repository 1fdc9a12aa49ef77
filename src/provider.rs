//! The provider aggregate and its HTTP surface.
//!
//! [`Provider`] holds the subsystems the protocol handlers share; the
//! surrounding platform constructs one and mounts [`routes`] into its own
//! router. The development binary does the same with in-memory backends.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use thiserror::Error;

use crate::config::ProviderConfig;
use crate::directory::{ClientDirectory, DirectoryError, OidcClient, UserDirectory};
use crate::keys::SigningKeys;
use crate::session::SessionStore;
use crate::store::ObjectStore;
use crate::{authorize, discovery, token, userinfo};

/// Client-ID index lookup outcomes that are not a single client.
#[derive(Error, Debug)]
pub enum ClientLookupError {
    /// No registered client carries that ID.
    #[error("no OIDC client found for client_id")]
    NotFound,

    /// More than one client carries that ID — a server-side invariant
    /// violation, never a client error.
    #[error("{0} OIDC clients share the same client_id")]
    Ambiguous(usize),

    /// Directory failure.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Central coordinator for the OIDC provider subsystem.
pub struct Provider {
    /// Provider configuration.
    pub config: ProviderConfig,
    /// Backing object store (client secrets live here).
    pub store: Arc<dyn ObjectStore>,
    /// Registered-client directory.
    pub clients: Arc<dyn ClientDirectory>,
    /// User/session-token directory.
    pub users: Arc<dyn UserDirectory>,
    /// Authorization-code sessions.
    pub sessions: Arc<SessionStore>,
    /// Signing key manager.
    pub keys: Arc<SigningKeys>,
}

impl Provider {
    /// Assemble a provider over the given backends.
    pub fn new(
        config: ProviderConfig,
        store: Arc<dyn ObjectStore>,
        clients: Arc<dyn ClientDirectory>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(
            store.clone(),
            config.namespaces.sessions.clone(),
            config.session_expiry(),
            config.retry_policy(),
        ));
        let keys = Arc::new(SigningKeys::new(
            store.clone(),
            config.namespaces.signing_keys.clone(),
        ));

        Self {
            config,
            store,
            clients,
            users,
            sessions,
            keys,
        }
    }

    /// The `iss` claim value.
    #[must_use]
    pub fn issuer(&self) -> String {
        self.config.issuer_url()
    }

    /// Resolve exactly one client by assigned client ID.
    pub async fn find_client(&self, client_id: &str) -> Result<OidcClient, ClientLookupError> {
        let mut clients = self.clients.find_by_client_id(client_id).await?;
        match clients.len() {
            0 => Err(ClientLookupError::NotFound),
            1 => Ok(clients.remove(0)),
            n => Err(ClientLookupError::Ambiguous(n)),
        }
    }
}

/// Build the provider's router, mounted under `/oidc`.
pub fn routes(provider: Arc<Provider>) -> Router {
    Router::new()
        .route(
            "/oidc/.well-known/openid-configuration",
            get(discovery::configuration),
        )
        .route("/oidc/.well-known/jwks.json", get(discovery::jwks))
        .route(
            "/oidc/authorize",
            get(authorize::authorize_query).post(authorize::authorize_form),
        )
        .route("/oidc/token", post(token::token))
        .route("/oidc/userinfo", get(userinfo::userinfo))
        .with_state(provider)
}
