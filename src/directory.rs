//! Read/write contracts for platform resources.
//!
//! The protocol core never talks to the platform's resource machinery
//! directly. It consumes three narrow contracts:
//!
//! - [`ClientDirectory`] — registered OAuth2 clients (index lookup by
//!   client ID, status/annotation patches).
//! - [`UserDirectory`] — users, their attribute records, and the platform
//!   session tokens this provider piggybacks on.
//!
//! In-memory implementations back the test suite and the development
//! binary. Production embeds the provider and supplies adapters over the
//! platform's own caches.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;

/// Errors surfaced by the directories.
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// No resource with that identifier.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other lookup/update failure.
    #[error("directory backend error: {0}")]
    Backend(String),
}

impl DirectoryError {
    /// Returns `true` for the not-found error class.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Desired configuration of a registered OAuth2 client.
#[derive(Debug, Clone, Default)]
pub struct OidcClientSpec {
    /// Redirect URIs a request must exactly match one of.
    pub redirect_uris: Vec<String>,
    /// ID/access token lifetime in seconds.
    pub token_expiration_seconds: i64,
    /// Refresh token lifetime in seconds.
    pub refresh_token_expiration_seconds: i64,
}

/// Fields assigned by the lifecycle controller, not the administrator.
#[derive(Debug, Clone, Default)]
pub struct OidcClientStatus {
    /// The opaque client ID. Empty until first reconciliation.
    pub client_id: String,
}

/// A registered OAuth2 client resource.
#[derive(Debug, Clone, Default)]
pub struct OidcClient {
    /// Stable internal resource name.
    pub name: String,
    /// Administrator-declared configuration.
    pub spec: OidcClientSpec,
    /// Controller-assigned status.
    pub status: OidcClientStatus,
    /// Declarative annotations (secret lifecycle markers, used-at stamps).
    pub annotations: BTreeMap<String, String>,
}

/// A platform user.
#[derive(Debug, Clone)]
pub struct User {
    /// Stable user identifier (the token subject).
    pub id: String,
    /// Display name, surfaced as `preferred_username`.
    pub display_name: String,
    /// Disabled users are denied token issuance.
    pub enabled: bool,
}

/// A user's attribute record. Group memberships are keyed by the auth
/// provider that asserted them.
#[derive(Debug, Clone, Default)]
pub struct UserAttributes {
    /// Provider name to group principal names.
    pub group_principals: BTreeMap<String, Vec<String>>,
}

/// A pre-existing platform session token. Consumed, never issued, by this
/// provider.
#[derive(Debug, Clone)]
pub struct SessionToken {
    /// Token resource name. Hashes of this name bind refresh tokens.
    pub name: String,
    /// The token's secret value, verified on the authorize path.
    pub secret: String,
    /// Owning user.
    pub user_id: String,
    /// External auth provider that authenticated the user, if any.
    pub auth_provider: Option<String>,
    /// Disabled tokens are denied token issuance.
    pub enabled: bool,
    /// Expiry instant; `None` means non-expiring.
    pub expires_at: Option<DateTime<Utc>>,
    /// Labels; the provider adds a per-client label when issuing refresh
    /// tokens so platform-side revocation can be keyed by client.
    pub labels: BTreeMap<String, String>,
}

impl SessionToken {
    /// Returns `true` once the token has passed its expiry instant.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() > at)
    }
}

/// Registered-client lookups and patches.
#[async_trait::async_trait]
pub trait ClientDirectory: Send + Sync + 'static {
    /// All registered clients.
    async fn list(&self) -> Result<Vec<OidcClient>, DirectoryError>;

    /// Fetch a client by resource name.
    async fn get(&self, name: &str) -> Result<OidcClient, DirectoryError>;

    /// Index lookup by assigned client ID. More than one entry indicates a
    /// server-side invariant violation the caller must treat as fatal.
    async fn find_by_client_id(&self, client_id: &str) -> Result<Vec<OidcClient>, DirectoryError>;

    /// Persist spec/annotation changes of an existing client.
    async fn update(&self, client: OidcClient) -> Result<OidcClient, DirectoryError>;

    /// Patch the assigned client ID into the client's status.
    async fn set_client_id(&self, name: &str, client_id: &str) -> Result<(), DirectoryError>;

    /// Patch a single annotation (used-at stamping).
    async fn set_annotation(
        &self,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DirectoryError>;
}

/// User, attribute, and session-token lookups.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    /// Fetch a user by identifier.
    async fn get_user(&self, id: &str) -> Result<User, DirectoryError>;

    /// Fetch a user's attribute record. Not-found is tolerated by callers
    /// as "no groups".
    async fn get_user_attributes(&self, id: &str) -> Result<UserAttributes, DirectoryError>;

    /// Fetch a session token by resource name.
    async fn get_session_token(&self, name: &str) -> Result<SessionToken, DirectoryError>;

    /// All session tokens owned by a user.
    async fn list_session_tokens(&self, user_id: &str) -> Result<Vec<SessionToken>, DirectoryError>;

    /// Add a label to a session token.
    async fn label_session_token(
        &self,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DirectoryError>;

    /// Whether the named external auth provider is currently disabled.
    async fn is_auth_provider_disabled(&self, provider: &str) -> Result<bool, DirectoryError>;
}

/// In-memory client directory backed by `DashMap`.
#[derive(Default)]
pub struct InMemoryClientDirectory {
    clients: DashMap<String, OidcClient>,
}

impl InMemoryClientDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a client.
    pub fn insert(&self, client: OidcClient) {
        self.clients.insert(client.name.clone(), client);
    }

    /// Remove a client by resource name.
    pub fn remove(&self, name: &str) -> Option<OidcClient> {
        self.clients.remove(name).map(|(_, c)| c)
    }
}

#[async_trait::async_trait]
impl ClientDirectory for InMemoryClientDirectory {
    async fn list(&self) -> Result<Vec<OidcClient>, DirectoryError> {
        Ok(self.clients.iter().map(|c| c.clone()).collect())
    }

    async fn get(&self, name: &str) -> Result<OidcClient, DirectoryError> {
        self.clients
            .get(name)
            .map(|c| c.clone())
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))
    }

    async fn find_by_client_id(&self, client_id: &str) -> Result<Vec<OidcClient>, DirectoryError> {
        Ok(self
            .clients
            .iter()
            .filter(|c| c.status.client_id == client_id)
            .map(|c| c.clone())
            .collect())
    }

    async fn update(&self, client: OidcClient) -> Result<OidcClient, DirectoryError> {
        if !self.clients.contains_key(&client.name) {
            return Err(DirectoryError::NotFound(client.name));
        }
        self.clients.insert(client.name.clone(), client.clone());
        Ok(client)
    }

    async fn set_client_id(&self, name: &str, client_id: &str) -> Result<(), DirectoryError> {
        let mut client = self
            .clients
            .get_mut(name)
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))?;
        client.status.client_id = client_id.to_string();
        Ok(())
    }

    async fn set_annotation(
        &self,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DirectoryError> {
        let mut client = self
            .clients
            .get_mut(name)
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))?;
        client
            .annotations
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// In-memory user directory backed by `DashMap` indices.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: DashMap<String, User>,
    attributes: DashMap<String, UserAttributes>,
    tokens: DashMap<String, SessionToken>,
    disabled_providers: DashMap<String, ()>,
}

impl InMemoryUserDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user.
    pub fn insert_user(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    /// Insert or replace a user's attribute record.
    pub fn insert_attributes(&self, user_id: &str, attributes: UserAttributes) {
        self.attributes.insert(user_id.to_string(), attributes);
    }

    /// Insert or replace a session token.
    pub fn insert_token(&self, token: SessionToken) {
        self.tokens.insert(token.name.clone(), token);
    }

    /// Remove a session token by name.
    pub fn remove_token(&self, name: &str) -> Option<SessionToken> {
        self.tokens.remove(name).map(|(_, t)| t)
    }

    /// Mark an auth provider as disabled.
    pub fn disable_provider(&self, provider: &str) {
        self.disabled_providers.insert(provider.to_string(), ());
    }
}

#[async_trait::async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn get_user(&self, id: &str) -> Result<User, DirectoryError> {
        self.users
            .get(id)
            .map(|u| u.clone())
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))
    }

    async fn get_user_attributes(&self, id: &str) -> Result<UserAttributes, DirectoryError> {
        self.attributes
            .get(id)
            .map(|a| a.clone())
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))
    }

    async fn get_session_token(&self, name: &str) -> Result<SessionToken, DirectoryError> {
        self.tokens
            .get(name)
            .map(|t| t.clone())
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))
    }

    async fn list_session_tokens(
        &self,
        user_id: &str,
    ) -> Result<Vec<SessionToken>, DirectoryError> {
        Ok(self
            .tokens
            .iter()
            .filter(|t| t.user_id == user_id)
            .map(|t| t.clone())
            .collect())
    }

    async fn label_session_token(
        &self,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DirectoryError> {
        let mut token = self
            .tokens
            .get_mut(name)
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))?;
        token.labels.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn is_auth_provider_disabled(&self, provider: &str) -> Result<bool, DirectoryError> {
        Ok(self.disabled_providers.contains_key(provider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn find_by_client_id_matches_status() {
        let dir = InMemoryClientDirectory::new();
        dir.insert(OidcClient {
            name: "app".into(),
            status: OidcClientStatus {
                client_id: "client-abc".into(),
            },
            ..OidcClient::default()
        });

        let found = dir.find_by_client_id("client-abc").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "app");
        assert!(dir.find_by_client_id("client-xyz").await.unwrap().is_empty());
    }

    #[test]
    fn token_expiry() {
        let mut token = SessionToken {
            name: "token-1".into(),
            secret: "s".into(),
            user_id: "u-1".into(),
            auth_provider: None,
            enabled: true,
            expires_at: None,
            labels: BTreeMap::new(),
        };
        assert!(!token.is_expired());

        token.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(token.is_expired());
    }
}
