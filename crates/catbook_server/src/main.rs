#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use catbook_core::{LabelDetector, UploadStore};
use catbook_server::config::{env_bool, load_env_file};
use catbook_server::{AppState, ServerConfig, VERSION, build_router, build_vision_client};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env_bool("CATBOOK_LOG_JSON", false) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
            }
            _ => {
                warn!("cannot register unix signal handlers, waiting for ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // `.env` values must be visible before tracing reads CATBOOK_LOG_JSON.
    let env_file = load_env_file(None);
    init_tracing();
    match env_file {
        Ok(Some(path)) => info!(path = %path.display(), "loaded environment file"),
        Ok(None) => debug!("no .env file found"),
        Err(e) => warn!("cannot read .env file: {e}"),
    }

    let config = ServerConfig::from_env().context("cannot load configuration")?;
    let credentials = config
        .resolve_credentials(&|name| std::env::var(name).ok())
        .context("cannot set up classification credentials")?;
    let store = UploadStore::open(&config.upload_dir)?;
    let detector = build_vision_client(&config, credentials)?;

    info!(
        version = VERSION,
        backend = detector.backend_tag(),
        upload_dir = %config.upload_dir.display(),
        static_dir = %config.static_dir.display(),
        accept_label = %config.accept_label,
        "starting catbook"
    );

    let addr = config.bind_addr();
    let port = config.port;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    let app = build_router(AppState::new(store, Arc::new(detector), config));
    info!("Server running on port {port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await
        .context("server stopped with an error")?;
    info!("shutdown complete");
    Ok(())
}
