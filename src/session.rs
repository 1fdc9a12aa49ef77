//! Authorization-code session store.
//!
//! A [`Session`] correlates an issued authorization code with the request
//! that produced it. Sessions are persisted in the backing object store
//! under the code itself, labeled for sweep eligibility, and expire after
//! a configured duration (default ten minutes) whether or not the record
//! is still physically present.
//!
//! # Consistency
//!
//! The backing store may be read-after-write inconsistent across replicas,
//! so `get` retries with bounded exponential backoff before declaring a
//! code invalid. The retry policy is injectable so tests run with
//! zero-latency retries.
//!
//! All operations and the background sweep share one mutex. The store
//! offers no transactional compare-and-delete, and briefly blocking request
//! handling during an infrequent sweep pass is an acceptable cost for not
//! racing read-modify-delete cycles.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::{ObjectStore, Record, StoreError};

/// Label marking records as sweep-eligible sessions.
pub const SESSION_LABEL_KEY: &str = "oidc.management.io/session";
/// Value of the sweep label.
pub const SESSION_LABEL_VALUE: &str = "true";

const SESSION_DATA_KEY: &str = "session";

/// Default session expiry.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(600);

/// Errors surfaced by the session store.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A record is already present for that code.
    #[error("code already exists")]
    CodeAlreadyExists,

    /// No record for that code, even after retries.
    #[error("invalid code")]
    InvalidCode,

    /// The record exists but is older than the configured expiry.
    #[error("the code has expired")]
    Expired,

    /// The record exists but its payload does not deserialize.
    #[error("malformed session record: {0}")]
    Malformed(String),

    /// Backing store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Returns `true` when the underlying store reported not-found.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_not_found())
    }
}

/// Server-side record binding an authorization code to its request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Client the code was issued to.
    pub client_id: String,
    /// Name of the bound platform session token.
    pub token_name: String,
    /// Granted scopes, in request order.
    pub scope: Vec<String>,
    /// PKCE S256 code challenge.
    pub code_challenge: String,
    /// OIDC nonce; empty when the request carried none.
    pub nonce: String,
    /// Creation instant; drives expiry.
    pub created_at: DateTime<Utc>,
}

/// Bounded retry policy for `get` absorbing replication lag.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total read attempts (first try included).
    pub attempts: usize,
    /// Initial backoff delay.
    pub min_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// TTL-bound session store over the backing object store.
pub struct SessionStore {
    store: Arc<dyn ObjectStore>,
    namespace: String,
    expiry: Duration,
    retry: RetryPolicy,
    lock: Mutex<()>,
}

impl SessionStore {
    /// Create a session store.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        namespace: impl Into<String>,
        expiry: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            expiry,
            retry,
            lock: Mutex::new(()),
        }
    }

    /// Persist a session under a fresh code.
    ///
    /// The duplicate check is a direct existence read, not a compare-and-
    /// swap: code entropy, not this check, is the real collision guard.
    pub async fn add(&self, code: &str, session: &Session) -> Result<(), SessionError> {
        let _guard = self.lock.lock().await;

        match self.store.get(&self.namespace, code).await {
            Ok(_) => return Err(SessionError::CodeAlreadyExists),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let mut record = Record::new(code);
        record
            .labels
            .insert(SESSION_LABEL_KEY.to_string(), SESSION_LABEL_VALUE.to_string());
        record.data.insert(
            SESSION_DATA_KEY.to_string(),
            serde_json::to_vec(session).map_err(|e| SessionError::Malformed(e.to_string()))?,
        );

        match self.store.create(&self.namespace, record).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => Err(SessionError::CodeAlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch the session for a code.
    ///
    /// Retries not-found reads per the configured policy, then fails with
    /// [`SessionError::InvalidCode`]. A present-but-expired record is never
    /// treated as valid.
    pub async fn get(&self, code: &str) -> Result<Session, SessionError> {
        let _guard = self.lock.lock().await;

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.retry.min_delay)
            .with_max_delay(self.retry.max_delay)
            .with_max_times(self.retry.attempts.saturating_sub(1));
        let record = (|| async { self.store.get(&self.namespace, code).await })
            .retry(backoff)
            .when(StoreError::is_not_found)
            .await;

        let record = match record {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Err(SessionError::InvalidCode),
            Err(e) => return Err(e.into()),
        };

        let data = record
            .data
            .get(SESSION_DATA_KEY)
            .ok_or_else(|| SessionError::Malformed("missing session entry".to_string()))?;
        let session: Session =
            serde_json::from_slice(data).map_err(|e| SessionError::Malformed(e.to_string()))?;

        if session.created_at + self.expiry < Utc::now() {
            return Err(SessionError::Expired);
        }
        Ok(session)
    }

    /// Delete the record for a code.
    pub async fn remove(&self, code: &str) -> Result<(), SessionError> {
        let _guard = self.lock.lock().await;
        self.store.delete(&self.namespace, code).await?;
        Ok(())
    }

    /// One sweep pass: delete every labeled session older than the expiry.
    ///
    /// Individual deletion failures are logged and skipped; the pass keeps
    /// going.
    pub async fn sweep_once(&self) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().await;

        let records = self
            .store
            .list(&self.namespace, Some((SESSION_LABEL_KEY, SESSION_LABEL_VALUE)))
            .await?;

        let now = Utc::now();
        let mut removed = 0;
        for record in records {
            let Some(data) = record.data.get(SESSION_DATA_KEY) else {
                continue;
            };
            let session: Session = match serde_json::from_slice(data) {
                Ok(session) => session,
                Err(e) => {
                    warn!(code = %record.name, error = %e, "skipping malformed session record");
                    continue;
                }
            };
            if session.created_at + self.expiry < now {
                match self.store.delete(&self.namespace, &record.name).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!(code = %record.name, error = %e, "failed to delete expired session");
                    }
                }
            }
        }

        if removed > 0 {
            debug!(removed, "session sweep pass complete");
        }
        Ok(removed)
    }

    /// Spawn the background sweep, one pass per expiry interval, until the
    /// cancellation token fires.
    pub fn spawn_sweep(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.expiry);
            // Absorb the immediate first tick; a fresh store has nothing to sweep.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("session sweep stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            warn!(error = %e, "session sweep pass failed");
                        }
                    }
                }
            }
        })
    }
}
