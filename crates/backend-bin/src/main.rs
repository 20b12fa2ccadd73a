use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use neurodyx_backend_lib::{
    auth::JwksIdentityVerifier, config::Settings, create_router, shutdown_sweepers,
    storage::FlatFileDocumentStore, AppState,
};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Neurodyx screening and therapy REST backend
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the bind address from the configuration
    #[arg(long)]
    bind: Option<SocketAddr>,
}

fn init_tracing(settings: &Settings) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));

    let registry = tracing_subscriber::registry().with(filter);
    if settings.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize configuration; any problem here is fatal
    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(bind) = cli.bind {
        settings.bind_addr = bind;
    }
    settings.validate().context("invalid configuration")?;

    init_tracing(&settings);
    tracing::info!(?settings, "configuration loaded");

    // Create collaborators
    let store = Arc::new(
        FlatFileDocumentStore::new(&settings.data_dir)
            .with_context(|| format!("failed to open data dir {}", settings.data_dir.display()))?,
    );
    let verifier = Arc::new(
        JwksIdentityVerifier::new(
            &settings.auth.firebase_project_id,
            &settings.auth.google_client_id,
            settings.auth.upstream_timeout(),
        )
        .context("failed to build identity verifier")?,
    );

    // Create application state
    let addr = settings.bind_addr;
    let state = AppState::new(settings, store, verifier)?;
    let sweepers = state.spawn_sweepers();
    let app = create_router(state);

    // Start the server
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_sweepers(sweepers).await;
    tracing::info!("server stopped");

    Ok(())
}
