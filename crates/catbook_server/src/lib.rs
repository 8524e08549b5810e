#![forbid(unsafe_code)]

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn;
use axum::routing::{get, post};
use catbook_core::{AccessTokenSource, LabelDetector, UploadStore, VisionAuth, VisionClient};
use std::sync::Arc;

pub mod config;
mod error;
mod handlers;
mod middleware;
mod static_files;

pub use config::{ResolvedCredentials, ServerConfig, VisionSettings};
pub use error::{ApiError, MessageBody};
pub use handlers::{CatsBody, IMAGE_FIELD, ListQuery};

pub const CRATE_NAME: &str = "catbook_server";
pub const VERSION: &str = env!("CATBOOK_VERSION");

/// Shared handles every handler receives.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<UploadStore>,
    pub detector: Arc<dyn LabelDetector>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(store: UploadStore, detector: Arc<dyn LabelDetector>, config: ServerConfig) -> Self {
        Self {
            store: Arc::new(store),
            detector,
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;
    Router::new()
        .route("/healthz", get(handlers::healthz_handler))
        .route("/api/upload", post(handlers::upload_handler))
        .route("/api/cats", get(handlers::list_handler))
        .route("/api/cats/:id", get(handlers::cat_handler))
        .fallback(get(static_files::static_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(from_fn(middleware::request_tracing_middleware))
        .with_state(state)
}

/// Cloud Vision client authenticated with whatever credentials startup found.
pub fn build_vision_client(
    config: &ServerConfig,
    credentials: ResolvedCredentials,
) -> Result<VisionClient> {
    let vision = config.vision_config();
    let http = vision.http_client()?;
    let auth = match credentials {
        ResolvedCredentials::ServiceAccount(key) => {
            let tokens = AccessTokenSource::new(key, http.clone())?;
            tracing::info!(client_email = tokens.client_email(), "using service account");
            VisionAuth::ServiceAccount(Arc::new(tokens))
        }
        ResolvedCredentials::ApiKey(key) => {
            tracing::info!("using API key");
            VisionAuth::ApiKey(key)
        }
    };
    Ok(VisionClient::new(http, &vision, auth))
}
