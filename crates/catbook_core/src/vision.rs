//! Label detection through the Google Cloud Vision REST API.

use crate::LabelAnnotation;
use crate::credentials::{AccessTokenSource, CredentialsError};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_VISION_ENDPOINT: &str = "https://vision.googleapis.com";
pub const DEFAULT_MAX_RESULTS: u32 = 10;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const LABEL_DETECTION: &str = "LABEL_DETECTION";
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("empty image")]
    EmptyImage,
    #[error("classification request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("classification service returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("classification service rejected the image ({code}): {message}")]
    Annotate { code: i32, message: String },
    #[error("classification response contained no result")]
    EmptyResponse,
    #[error("authentication failed: {0}")]
    Auth(#[from] CredentialsError),
}

/// Anything that can turn image bytes into labels.
#[async_trait]
pub trait LabelDetector: Send + Sync + 'static {
    fn backend_tag(&self) -> &'static str;

    async fn detect_labels(&self, image: &[u8]) -> Result<Vec<LabelAnnotation>, VisionError>;
}

/// How requests to the Vision API authenticate.
pub enum VisionAuth {
    ApiKey(String),
    ServiceAccount(Arc<AccessTokenSource>),
}

impl fmt::Debug for VisionAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisionAuth::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            VisionAuth::ServiceAccount(src) => {
                f.debug_tuple("ServiceAccount").field(src).finish()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionConfig {
    /// Base URL, without the `/v1/...` path.
    pub endpoint: String,
    pub max_results: u32,
    pub timeout: Duration,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_VISION_ENDPOINT.to_string(),
            max_results: DEFAULT_MAX_RESULTS,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl VisionConfig {
    pub fn annotate_url(&self) -> String {
        format!("{}/v1/images:annotate", self.endpoint.trim_end_matches('/'))
    }

    /// HTTP client shared by the Vision client and the token source.
    pub fn http_client(&self) -> Result<reqwest::Client, VisionError> {
        Ok(reqwest::Client::builder().timeout(self.timeout).build()?)
    }
}

#[derive(Serialize)]
struct AnnotateRequest<'a> {
    requests: [AnnotateImageRequest<'a>; 1],
}

#[derive(Serialize)]
struct AnnotateImageRequest<'a> {
    image: ImageContent,
    features: [Feature<'a>; 1],
}

#[derive(Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Feature<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    max_results: u32,
}

#[derive(Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    label_annotations: Vec<LabelAnnotation>,
    #[serde(default)]
    error: Option<RpcStatus>,
}

#[derive(Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RpcStatus,
}

/// Cloud Vision `images:annotate` client asking for label detection only.
#[derive(Debug)]
pub struct VisionClient {
    http: reqwest::Client,
    annotate_url: String,
    auth: VisionAuth,
    max_results: u32,
}

impl VisionClient {
    pub fn new(http: reqwest::Client, cfg: &VisionConfig, auth: VisionAuth) -> Self {
        Self {
            http,
            annotate_url: cfg.annotate_url(),
            auth,
            max_results: cfg.max_results,
        }
    }

    async fn request(&self, body: &AnnotateRequest<'_>) -> Result<reqwest::Response, VisionError> {
        let request = match &self.auth {
            VisionAuth::ApiKey(key) => {
                let url = format!("{}?key={}", self.annotate_url, urlencoding::encode(key));
                self.http.post(url)
            }
            VisionAuth::ServiceAccount(tokens) => {
                let token = tokens.access_token().await?;
                self.http.post(&self.annotate_url).bearer_auth(token)
            }
        };
        Ok(request.json(body).send().await?)
    }
}

#[async_trait]
impl LabelDetector for VisionClient {
    fn backend_tag(&self) -> &'static str {
        "cloud-vision"
    }

    async fn detect_labels(&self, image: &[u8]) -> Result<Vec<LabelAnnotation>, VisionError> {
        if image.is_empty() {
            return Err(VisionError::EmptyImage);
        }
        let body = AnnotateRequest {
            requests: [AnnotateImageRequest {
                image: ImageContent {
                    content: STANDARD.encode(image),
                },
                features: [Feature {
                    kind: LABEL_DETECTION,
                    max_results: self.max_results,
                }],
            }],
        };

        let started = Instant::now();
        let response = self.request(&body).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VisionError::Status {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        let parsed: AnnotateResponse = response.json().await?;
        let first = parsed
            .responses
            .into_iter()
            .next()
            .ok_or(VisionError::EmptyResponse)?;
        if let Some(err) = first.error {
            return Err(VisionError::Annotate {
                code: err.code,
                message: err.message,
            });
        }
        tracing::debug!(
            labels = first.label_annotations.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "label detection finished"
        );
        Ok(first.label_annotations)
    }
}

fn error_message(body: &str) -> String {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        return envelope.error.message;
    }
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
