//! Standalone development server for the embedded OIDC provider.
//!
//! Production embeds [`oidc_provider::routes`] into the platform's own
//! HTTP surface with adapters over its resource caches. This binary wires
//! the same router over in-memory backends so the protocol endpoints can
//! be exercised end to end.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use oidc_provider::config::ProviderConfig;
use oidc_provider::directory::{InMemoryClientDirectory, InMemoryUserDirectory};
use oidc_provider::store::InMemoryObjectStore;
use oidc_provider::{routes, setup_tracing, Provider};

/// Embedded OIDC provider - development server
#[derive(Parser, Debug)]
#[command(name = "oidc-provider")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OIDC_PROVIDER_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address override
    #[arg(short, long, env = "OIDC_PROVIDER_BIND")]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "OIDC_PROVIDER_LOG_LEVEL")]
    log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OIDC_PROVIDER_LOG_FORMAT")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => {
            info!("provider shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("provider error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = ProviderConfig::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.server.bind,
        issuer = %config.issuer_url(),
        "starting OIDC provider"
    );

    let bind = config.server.bind.clone();
    let provider = Arc::new(Provider::new(
        config,
        Arc::new(InMemoryObjectStore::new()),
        Arc::new(InMemoryClientDirectory::new()),
        Arc::new(InMemoryUserDirectory::new()),
    ));
    provider.keys.ensure_keys().await?;

    let cancel = CancellationToken::new();
    let sweep = provider.sessions.clone().spawn_sweep(cancel.clone());

    let app = routes(provider).layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let cancel = cancel.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
                cancel.cancel();
            }
        })
        .await?;

    cancel.cancel();
    sweep.await?;
    Ok(())
}
