//! Client lifecycle reconciliation.
//!
//! [`ClientSecretController`] reacts to registered-client changes: it
//! assigns the opaque client ID on first sight, keeps the client's secret
//! record in existence, and executes the declarative secret lifecycle
//! annotations administrators set on the client resource.
//!
//! Secret values are write-only from the administrator's point of view:
//! they live in the backing record, never in the client resource itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::directory::{ClientDirectory, OidcClient};
use crate::error::{Error, Result};
use crate::generator;
use crate::store::{ObjectStore, Record};

/// Requests one additional secret.
pub const CREATE_SECRET_ANNOTATION: &str = "oidc.management.io/create-client-secret";
/// Requests regeneration of the named secrets (comma-separated keys).
pub const REGENERATE_SECRET_ANNOTATION: &str = "oidc.management.io/regenerate-client-secret";
/// Requests removal of the named secrets (comma-separated keys).
pub const REMOVE_SECRET_ANNOTATION: &str = "oidc.management.io/remove-client-secret";
/// Prefix of the per-secret used-at stamp; the secret key completes it.
pub const SECRET_USED_AT_PREFIX: &str = "oidc.management.io/client-secret-used-";
/// Prefix of secret entry keys inside the client's secret record.
pub const SECRET_KEY_PREFIX: &str = "client-secret-";

/// Reconciles registered clients against their secret records.
pub struct ClientSecretController {
    clients: Arc<dyn ClientDirectory>,
    store: Arc<dyn ObjectStore>,
    namespace: String,
}

impl ClientSecretController {
    /// Create a controller writing secret records into the given namespace.
    pub fn new(
        clients: Arc<dyn ClientDirectory>,
        store: Arc<dyn ObjectStore>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            clients,
            store,
            namespace: namespace.into(),
        }
    }

    /// Reconcile one client change.
    ///
    /// Ordering is fixed: client-ID assignment, record existence, then the
    /// create/regenerate/remove annotations. Each annotation is cleared
    /// once executed, so redelivery of the same change is a no-op.
    pub async fn on_change(&self, client: &OidcClient) -> Result<OidcClient> {
        let mut client = client.clone();

        if client.status.client_id.is_empty() {
            let client_id = self.assign_client_id(&client).await?;
            client.status.client_id = client_id;
        }

        self.ensure_secret_record(&client).await?;
        self.apply_secret_annotations(&mut client).await?;
        Ok(client)
    }

    /// Clean up after a client deletion. A missing record is fine, and so
    /// is a client that never got far enough to be assigned an ID.
    pub async fn on_remove(&self, client: &OidcClient) -> Result<()> {
        if client.status.client_id.is_empty() {
            return Ok(());
        }
        match self
            .store
            .delete(&self.namespace, &client.status.client_id)
            .await
        {
            Ok(()) => {
                info!(client = %client.name, "removed client secret record");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Mint a fresh client ID and patch it into the client's status.
    ///
    /// A collision with any existing client is a hard error rather than a
    /// retry: at this ID entropy a collision signals a broken random
    /// source, and re-rolling would mask it.
    async fn assign_client_id(&self, client: &OidcClient) -> Result<String> {
        let client_id = generator::generate_client_id()?;

        let taken = self
            .clients
            .list()
            .await?
            .iter()
            .any(|c| c.status.client_id == client_id);
        if taken {
            return Err(Error::Internal(format!(
                "generated client ID already in use for client {}",
                client.name
            )));
        }

        self.clients.set_client_id(&client.name, &client_id).await?;
        info!(client = %client.name, "assigned client ID");
        Ok(client_id)
    }

    /// Create the secret record, keyed by the assigned client ID, with an
    /// initial secret if it is missing.
    async fn ensure_secret_record(&self, client: &OidcClient) -> Result<()> {
        match self
            .store
            .get(&self.namespace, &client.status.client_id)
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let mut record = Record::new(&client.status.client_id);
        record.data.insert(
            format!("{SECRET_KEY_PREFIX}1"),
            generator::generate_client_secret()?.into_bytes(),
        );
        match self.store.create(&self.namespace, record).await {
            Ok(()) => {
                info!(client = %client.name, "created client secret record");
                Ok(())
            }
            // Lost the creation race to a peer replica.
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_secret_annotations(&self, client: &mut OidcClient) -> Result<()> {
        let wants_create = client.annotations.contains_key(CREATE_SECRET_ANNOTATION);
        let regenerate = client.annotations.get(REGENERATE_SECRET_ANNOTATION).cloned();
        let remove = client.annotations.get(REMOVE_SECRET_ANNOTATION).cloned();
        if !wants_create && regenerate.is_none() && remove.is_none() {
            return Ok(());
        }

        let mut record = self
            .store
            .get(&self.namespace, &client.status.client_id)
            .await?;
        let mut dirty = false;

        if wants_create {
            let next = next_secret_index(&record.data);
            record.data.insert(
                format!("{SECRET_KEY_PREFIX}{next}"),
                generator::generate_client_secret()?.into_bytes(),
            );
            dirty = true;
            info!(client = %client.name, key = %format!("{SECRET_KEY_PREFIX}{next}"), "created additional client secret");
        }

        if let Some(keys) = regenerate {
            for key in split_keys(&keys) {
                // Only existing secrets are regenerated; unknown keys are
                // reported and skipped.
                if record.data.contains_key(key) {
                    record
                        .data
                        .insert(key.to_string(), generator::generate_client_secret()?.into_bytes());
                    dirty = true;
                    info!(client = %client.name, key, "regenerated client secret");
                } else {
                    warn!(client = %client.name, key, "cannot regenerate unknown client secret");
                }
            }
        }

        if let Some(keys) = remove {
            for key in split_keys(&keys) {
                if record.data.remove(key).is_some() {
                    dirty = true;
                    info!(client = %client.name, key, "removed client secret");
                } else {
                    warn!(client = %client.name, key, "cannot remove unknown client secret");
                }
            }
        }

        if dirty {
            self.store.update(&self.namespace, record).await?;
        }

        // Clear the executed annotations so redelivery is a no-op.
        client.annotations.remove(CREATE_SECRET_ANNOTATION);
        client.annotations.remove(REGENERATE_SECRET_ANNOTATION);
        client.annotations.remove(REMOVE_SECRET_ANNOTATION);
        *client = self.clients.update(client.clone()).await?;
        debug!(client = %client.name, "cleared executed secret annotations");
        Ok(())
    }
}

/// The next free `client-secret-N` index: one past the highest in use,
/// so removed indices are never reused.
fn next_secret_index(data: &BTreeMap<String, Vec<u8>>) -> u32 {
    data.keys()
        .filter_map(|key| key.strip_prefix(SECRET_KEY_PREFIX))
        .filter_map(|suffix| suffix.parse::<u32>().ok())
        .max()
        .unwrap_or(0)
        + 1
}

fn split_keys(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|k| !k.is_empty())
}
