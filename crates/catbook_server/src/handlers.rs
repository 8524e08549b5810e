use crate::AppState;
use crate::error::{ApiError, MessageBody};
use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use catbook_core::{CatId, StagedUpload, Verdict, label_names};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::spawn_blocking;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

/// Multipart field carrying the uploaded image.
pub const IMAGE_FIELD: &str = "image";

const ACCEPTED: MessageBody = MessageBody::new("We got cat.");
const REJECTED: MessageBody = MessageBody::new("Must be only cats");
const SNIFF_BYTES: usize = 32;

#[derive(Debug, Serialize)]
pub struct CatsBody {
    pub cats: Vec<CatId>,
    pub message: &'static str,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Keep only the most recent `limit` entries.
    pub limit: Option<usize>,
}

pub(crate) async fn healthz_handler() -> &'static str {
    "ok"
}

pub(crate) async fn upload_handler(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<MessageBody>), ApiError> {
    let mut multipart = multipart.map_err(|e| ApiError::Multipart(e.body_text()))?;
    let bytes = read_image_field(&mut multipart).await?;
    let format = image::guess_format(&bytes)
        .map(|f| f.to_mime_type())
        .unwrap_or("unknown");

    let store = state.store.clone();
    let to_stage = bytes.clone();
    let staged = spawn_blocking(move || store.stage(&to_stage)).await??;

    let labels = match state.detector.detect_labels(&bytes).await {
        Ok(labels) => labels,
        Err(e) => {
            discard(staged).await;
            return Err(e.into());
        }
    };

    let verdict = Verdict::from_labels(&labels, &state.config.accept_label);
    let label_list = label_names(&labels).join(",");
    if verdict.is_accepted() {
        let id = spawn_blocking(move || staged.commit()).await??;
        info!(
            id = %id,
            bytes = bytes.len(),
            format,
            labels = %label_list,
            "upload accepted"
        );
        Ok((StatusCode::CREATED, Json(ACCEPTED)))
    } else {
        let id = staged.id().clone();
        discard(staged).await;
        info!(
            id = %id,
            bytes = bytes.len(),
            format,
            labels = %label_list,
            "upload rejected"
        );
        Ok((StatusCode::BAD_REQUEST, Json(REJECTED)))
    }
}

async fn read_image_field(multipart: &mut Multipart) -> Result<Bytes, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        // Text parts that reuse the field name are not files.
        if field.name() == Some(IMAGE_FIELD) && field.file_name().is_some() {
            return Ok(field.bytes().await?);
        }
    }
    Err(ApiError::MissingImage)
}

async fn discard(staged: StagedUpload) {
    let id = staged.id().clone();
    match spawn_blocking(move || staged.discard()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(id = %id, "cannot delete staged upload: {e:#}"),
        Err(e) => warn!(id = %id, "staged upload cleanup task failed: {e}"),
    }
}

pub(crate) async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> (StatusCode, Json<CatsBody>) {
    let store = state.store.clone();
    let listed = spawn_blocking(move || match query.limit {
        Some(limit) => store.recent(limit),
        None => store.list(),
    })
    .await
    .map_err(anyhow::Error::from)
    .and_then(|res| res);

    match listed {
        Ok(entries) => (
            StatusCode::OK,
            Json(CatsBody {
                cats: entries.into_iter().map(|e| e.id).collect(),
                message: "Some cats",
            }),
        ),
        Err(e) => {
            error!("listing uploads failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CatsBody {
                    cats: Vec::new(),
                    message: "Internal server error",
                }),
            )
        }
    }
}

pub(crate) async fn cat_handler(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Response, ApiError> {
    let id: CatId = raw_id.parse().map_err(|_| ApiError::NotFound)?;
    let path = state.store.path_of(&id);

    let mut file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ApiError::NotFound),
        Err(e) => return Err(e.into()),
    };
    let meta = file.metadata().await?;
    if !meta.is_file() {
        return Err(ApiError::NotFound);
    }

    let mut head = [0u8; SNIFF_BYTES];
    let read = file.read(&mut head).await?;
    file.seek(SeekFrom::Start(0)).await?;
    let content_type = image::guess_format(&head[..read])
        .map(|f| f.to_mime_type())
        .unwrap_or("application/octet-stream");

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (CONTENT_TYPE, HeaderValue::from_static(content_type)),
            (CONTENT_LENGTH, HeaderValue::from(meta.len())),
        ],
        body,
    )
        .into_response())
}
