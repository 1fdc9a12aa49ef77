//! Backing object store — the namespaced key-value persistence layer.
//!
//! The [`ObjectStore`] trait abstracts over the platform's object storage
//! (sessions, client secrets, signing keys). Records are named blobs of
//! keyed byte data plus string labels used for list filtering. The store
//! may be eventually consistent across replicas: a `get` immediately after
//! a `create` on another replica can legitimately miss. Callers that care
//! (the session store) retry with bounded backoff.
//!
//! The only in-tree implementation is [`InMemoryObjectStore`], backed by
//! `DashMap`, used by tests and the development binary.

use std::collections::BTreeMap;

use dashmap::DashMap;
use thiserror::Error;

/// Errors surfaced by the backing object store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No record with that name in the namespace.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A record with that name already exists.
    #[error("record already exists: {0}")]
    AlreadyExists(String),

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns `true` for the not-found error class.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` for the already-exists error class.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// A stored record: named, labeled, with keyed byte entries.
#[derive(Debug, Clone, Default)]
pub struct Record {
    /// Record name, unique within its namespace.
    pub name: String,
    /// String labels used for list filtering.
    pub labels: BTreeMap<String, String>,
    /// Keyed byte entries.
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Record {
    /// Create an empty record with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Trait abstracting the namespaced object store.
///
/// Implementations must be `Send + Sync` because the store is shared
/// across request-handling tasks and the background sweep.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch a record by name.
    async fn get(&self, namespace: &str, name: &str) -> Result<Record, StoreError>;

    /// Create a record; fails with [`StoreError::AlreadyExists`] if present.
    async fn create(&self, namespace: &str, record: Record) -> Result<(), StoreError>;

    /// Replace an existing record; fails with [`StoreError::NotFound`] if absent.
    async fn update(&self, namespace: &str, record: Record) -> Result<(), StoreError>;

    /// Delete a record; fails with [`StoreError::NotFound`] if absent.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// List records, optionally filtered to an exact label match.
    async fn list(
        &self,
        namespace: &str,
        label: Option<(&str, &str)>,
    ) -> Result<Vec<Record>, StoreError>;
}

/// In-memory object store backed by a `DashMap` per namespace.
#[derive(Default)]
pub struct InMemoryObjectStore {
    namespaces: DashMap<String, DashMap<String, Record>>,
}

impl InMemoryObjectStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn namespace(&self, namespace: &str) -> dashmap::mapref::one::RefMut<'_, String, DashMap<String, Record>> {
        self.namespaces.entry(namespace.to_string()).or_default()
    }
}

#[async_trait::async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Record, StoreError> {
        self.namespace(namespace)
            .get(name)
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn create(&self, namespace: &str, record: Record) -> Result<(), StoreError> {
        let ns = self.namespace(namespace);
        if ns.contains_key(&record.name) {
            return Err(StoreError::AlreadyExists(record.name));
        }
        ns.insert(record.name.clone(), record);
        Ok(())
    }

    async fn update(&self, namespace: &str, record: Record) -> Result<(), StoreError> {
        let ns = self.namespace(namespace);
        if !ns.contains_key(&record.name) {
            return Err(StoreError::NotFound(record.name));
        }
        ns.insert(record.name.clone(), record);
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.namespace(namespace)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn list(
        &self,
        namespace: &str,
        label: Option<(&str, &str)>,
    ) -> Result<Vec<Record>, StoreError> {
        let ns = self.namespace(namespace);
        let records = ns
            .iter()
            .filter(|r| match label {
                Some((k, v)) => r.labels.get(k).is_some_and(|lv| lv == v),
                None => true,
            })
            .map(|r| r.clone())
            .collect();
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get() {
        let store = InMemoryObjectStore::new();
        let mut record = Record::new("alpha");
        record.data.insert("k".into(), b"v".to_vec());
        store.create("ns", record).await.unwrap();

        let fetched = store.get("ns", "alpha").await.unwrap();
        assert_eq!(fetched.data.get("k").unwrap(), b"v");
    }

    #[tokio::test]
    async fn create_twice_fails() {
        let store = InMemoryObjectStore::new();
        store.create("ns", Record::new("alpha")).await.unwrap();
        let err = store.create("ns", Record::new("alpha")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let store = InMemoryObjectStore::new();
        store.create("a", Record::new("alpha")).await.unwrap();
        assert!(store.get("b", "alpha").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_label() {
        let store = InMemoryObjectStore::new();
        let mut labeled = Record::new("labeled");
        labeled.labels.insert("kind".into(), "session".into());
        store.create("ns", labeled).await.unwrap();
        store.create("ns", Record::new("plain")).await.unwrap();

        let all = store.list("ns", None).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = store.list("ns", Some(("kind", "session"))).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "labeled");
    }
}
