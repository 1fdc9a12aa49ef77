//! Configuration management.
//!
//! Layered the way the platform loads every subsystem: defaults, then an
//! optional YAML file, then `OIDC_PROVIDER_`-prefixed environment variables
//! (`__` separates nesting levels, e.g. `OIDC_PROVIDER_SESSION__EXPIRY_SECS`).

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::session::RetryPolicy;

/// Top-level provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProviderConfig {
    /// HTTP server configuration (development binary only).
    pub server: ServerConfig,
    /// External URL of the platform. OIDC endpoints live under
    /// `<issuer>/oidc` and token `iss` claims carry that value.
    pub issuer: String,
    /// Platform-session resolution for the authorize endpoint.
    pub auth: AuthConfig,
    /// Authorization-code session behavior.
    pub session: SessionConfig,
    /// Backing-store namespaces.
    pub namespaces: NamespaceConfig,
}

/// Bind configuration for the development binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

/// How the authorize endpoint resolves the caller's platform session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Cookie carrying the platform session token.
    pub cookie_name: String,
    /// Login page the browser is sent to when no valid session is bound.
    pub login_path: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cookie_name: "platform_session".to_string(),
            login_path: "/login".to_string(),
        }
    }
}

/// Authorization-code session expiry and read-retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds before an outstanding code expires. Also the sweep interval.
    pub expiry_secs: u64,
    /// Bounded backoff for reads racing backing-store replication.
    pub retry: RetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_secs: 600,
            retry: RetryConfig::default(),
        }
    }
}

/// Retry knobs, injectable so tests run with zero-latency retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total read attempts.
    pub attempts: usize,
    /// Initial backoff delay in milliseconds.
    pub min_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 4,
            min_delay_ms: 200,
            max_delay_ms: 2000,
        }
    }
}

/// Backing-store namespaces for the three record families.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Authorization-code sessions.
    pub sessions: String,
    /// Per-client secret records.
    pub client_secrets: String,
    /// The signing-key record.
    pub signing_keys: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            sessions: "oidc-sessions".to_string(),
            client_secrets: "oidc-client-secrets".to_string(),
            signing_keys: "oidc-signing-keys".to_string(),
        }
    }
}

impl ProviderConfig {
    /// Load configuration: defaults ← YAML file ← environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(p) = path {
            figment = figment.merge(Yaml::file(p));
        }
        figment = figment.merge(Env::prefixed("OIDC_PROVIDER_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        if self.issuer.is_empty() {
            self.issuer = format!("http://{}", self.server.bind);
        }
        Url::parse(&self.issuer)
            .map_err(|e| Error::Config(format!("issuer is not a valid URL: {e}")))?;
        self.issuer = self.issuer.trim_end_matches('/').to_string();

        if self.session.expiry_secs == 0 {
            return Err(Error::Config("session.expiry_secs must be non-zero".into()));
        }
        if self.session.retry.attempts == 0 {
            return Err(Error::Config("session.retry.attempts must be non-zero".into()));
        }
        Ok(())
    }

    /// The issuer value carried in token claims and the discovery document.
    #[must_use]
    pub fn issuer_url(&self) -> String {
        format!("{}/oidc", self.issuer)
    }

    /// Session expiry as a duration.
    #[must_use]
    pub fn session_expiry(&self) -> Duration {
        Duration::from_secs(self.session.expiry_secs)
    }

    /// The session-store retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.session.retry.attempts,
            min_delay: Duration::from_millis(self.session.retry.min_delay_ms),
            max_delay: Duration::from_millis(self.session.retry.max_delay_ms),
        }
    }
}
