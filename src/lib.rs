//! Embedded OIDC provider for a cluster-management platform.
//!
//! The platform acts as an OpenID Connect provider for registered client
//! applications: authorization-code grants with mandatory PKCE (S256),
//! refresh-token grants pinned to platform sessions, JWKS publication, and
//! discovery. Clients are platform resources reconciled by
//! [`lifecycle::ClientSecretController`]; tokens bind to pre-existing
//! platform sessions rather than running a login of their own.

pub mod authorize;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod generator;
pub mod keys;
pub mod lifecycle;
pub mod provider;
pub mod session;
pub mod store;
pub mod token;
pub mod userinfo;

pub use error::{Error, Result};
pub use provider::{routes, Provider};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set. `format` selects
/// `json` output; anything else gets the human-readable layer.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if matches!(format, Some("json")) {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}
