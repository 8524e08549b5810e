//! Serves the pre-built browser UI for every path the API does not claim.

use crate::AppState;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use std::path::{Path, PathBuf};

const INDEX: &str = "index.html";

pub(crate) async fn static_handler(State(state): State<AppState>, uri: Uri) -> Response {
    let Some(relative) = sanitize_path(uri.path()) else {
        return not_found();
    };
    let mut path = state.config.static_dir.join(relative);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => path.push(INDEX),
        Ok(_) => {}
        Err(_) => return not_found(),
    }
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(CONTENT_TYPE, content_type_for(&path))], bytes).into_response(),
        Err(e) => {
            tracing::debug!(path = %path.display(), "static file unavailable: {e}");
            not_found()
        }
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not found").into_response()
}

/// Relative filesystem path for a request path, or `None` when the request
/// tries to leave the bundle directory.
fn sanitize_path(request_path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for segment in request_path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s if s.contains('\\') || s.contains(':') || s.contains('\0') => return None,
            s => out.push(s),
        }
    }
    Some(out)
}

fn content_type_for(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let is_text = mime.type_() == mime_guess::mime::TEXT;
    if is_text && mime.get_param(mime_guess::mime::CHARSET).is_none() {
        format!("{mime}; charset=utf-8")
    } else {
        mime.to_string()
    }
}
