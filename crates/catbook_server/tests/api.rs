use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use catbook_core::{LabelAnnotation, LabelDetector, UploadStore, VisionError};
use catbook_server::config::DEFAULT_MAX_UPLOAD_BYTES;
use catbook_server::{AppState, ServerConfig, build_router};
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use tempfile::{TempDir, tempdir};

const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR fake cat pixels";

struct FakeDetector {
    labels: Vec<&'static str>,
    fail: bool,
    calls: AtomicUsize,
}

impl FakeDetector {
    fn labelling(labels: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            labels: labels.to_vec(),
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            labels: Vec::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LabelDetector for FakeDetector {
    fn backend_tag(&self) -> &'static str {
        "fake"
    }

    async fn detect_labels(&self, _image: &[u8]) -> Result<Vec<LabelAnnotation>, VisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(VisionError::Status {
                status: 503,
                message: "backend unavailable".into(),
            });
        }
        Ok(self.labels.iter().map(|l| LabelAnnotation::new(*l)).collect())
    }
}

struct TestServer {
    base: String,
    uploads: TempDir,
    _static_dir: TempDir,
    http: reqwest::Client,
}

impl TestServer {
    async fn spawn(detector: Arc<FakeDetector>) -> Self {
        Self::spawn_with_limit(detector, DEFAULT_MAX_UPLOAD_BYTES).await
    }

    async fn spawn_with_limit(detector: Arc<FakeDetector>, max_upload_bytes: usize) -> Self {
        let uploads = tempdir().expect("uploads tempdir");
        let static_dir = tempdir().expect("static tempdir");
        fs::write(
            static_dir.path().join("index.html"),
            "<!doctype html><title>CatBook</title>",
        )
        .expect("write index");

        let config = ServerConfig {
            upload_dir: uploads.path().to_path_buf(),
            static_dir: static_dir.path().to_path_buf(),
            max_upload_bytes,
            ..ServerConfig::default()
        };
        let store = UploadStore::open(&config.upload_dir).expect("open store");
        let app = build_router(AppState::new(store, detector, config));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve app");
        });

        Self {
            base: format!("http://{addr}"),
            uploads,
            _static_dir: static_dir,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn upload(&self, form: Form) -> (StatusCode, Value) {
        let response = self
            .http
            .post(self.url("/api/upload"))
            .multipart(form)
            .send()
            .await
            .expect("upload request");
        let status = response.status();
        (status, response.json().await.expect("json body"))
    }

    async fn cats(&self, query: &str) -> (StatusCode, Vec<String>) {
        let response = self
            .http
            .get(self.url(&format!("/api/cats{query}")))
            .send()
            .await
            .expect("list request");
        let status = response.status();
        let body: Value = response.json().await.expect("json body");
        let cats = body["cats"]
            .as_array()
            .expect("cats array")
            .iter()
            .map(|v| v.as_str().expect("string id").to_string())
            .collect();
        (status, cats)
    }

    /// Files stored anywhere under the uploads directory, staging included.
    fn stored_files(&self) -> Vec<String> {
        fn walk(dir: &Path, out: &mut Vec<String>) {
            for entry in fs::read_dir(dir).expect("read dir") {
                let entry = entry.expect("dir entry");
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, out);
                } else {
                    out.push(entry.file_name().to_string_lossy().to_string());
                }
            }
        }
        let mut out = Vec::new();
        walk(self.uploads.path(), &mut out);
        out
    }
}

fn image_form(bytes: &'static [u8]) -> Form {
    Form::new().part(
        "image",
        Part::bytes(bytes)
            .file_name("kitty.png")
            .mime_str("image/png")
            .expect("mime"),
    )
}

#[tokio::test]
async fn cat_upload_is_accepted_listed_and_served() {
    let detector = FakeDetector::labelling(&["Cat", "Whiskers", "Felidae"]);
    let server = TestServer::spawn(detector.clone()).await;

    let (status, body) = server.upload(image_form(PNG_BYTES)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["message"], "We got cat.");
    assert_eq!(detector.calls.load(Ordering::SeqCst), 1);

    let (status, cats) = server.cats("").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cats.len(), 1);
    assert_eq!(server.stored_files(), cats);

    let response = server
        .http
        .get(server.url(&format!("/api/cats/{}", cats[0])))
        .send()
        .await
        .expect("fetch cat");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("image/png")
    );
    assert_eq!(response.bytes().await.expect("body").as_ref(), PNG_BYTES);
}

#[tokio::test]
async fn non_cat_upload_is_rejected_and_deleted() {
    let server = TestServer::spawn(FakeDetector::labelling(&["Dog", "Snout", "Big cat"])).await;

    let (status, body) = server.upload(image_form(PNG_BYTES)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Must be only cats");
    assert!(server.stored_files().is_empty());

    let (status, cats) = server.cats("").await;
    assert_eq!(status, StatusCode::OK);
    assert!(cats.is_empty());
}

#[tokio::test]
async fn listing_is_ordered_by_modification_time() {
    let server = TestServer::spawn(FakeDetector::labelling(&["Cat"])).await;
    let now = SystemTime::now();
    for (name, age_secs) in [("ccc", 10), ("aaa", 300), ("bbb", 60)] {
        let file = File::create(server.uploads.path().join(name)).expect("create file");
        file.set_modified(now - Duration::from_secs(age_secs))
            .expect("set mtime");
    }

    let (status, cats) = server.cats("").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cats, vec!["aaa", "bbb", "ccc"]);

    let (_, recent) = server.cats("?limit=2").await;
    assert_eq!(recent, vec!["bbb", "ccc"]);
}

#[tokio::test]
async fn unknown_identifiers_are_not_found_and_server_keeps_running() {
    let server = TestServer::spawn(FakeDetector::labelling(&["Cat"])).await;

    for path in [
        "/api/cats/0123456789abcdef0123456789abcdef",
        "/api/cats/..%2F..%2Fetc%2Fpasswd",
        "/api/cats/.staging",
    ] {
        let response = server
            .http
            .get(server.url(path))
            .send()
            .await
            .expect("fetch cat");
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        let body: Value = response.json().await.expect("json body");
        assert_eq!(body["message"], "Not found");
    }

    let health = server
        .http
        .get(server.url("/healthz"))
        .send()
        .await
        .expect("healthz");
    assert_eq!(health.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_image_field_is_a_handled_server_error() {
    let detector = FakeDetector::labelling(&["Cat"]);
    let server = TestServer::spawn(detector.clone()).await;

    let form = Form::new().text("caption", "no file here");
    let (status, body) = server.upload(form).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["message"], "Internal server error");
    assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
    assert!(server.stored_files().is_empty());

    let (status, _) = server.cats("").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn text_part_named_image_is_not_an_upload() {
    let detector = FakeDetector::labelling(&["Cat"]);
    let server = TestServer::spawn(detector.clone()).await;

    let form = Form::new().text("image", "just some text, no file");
    let (status, body) = server.upload(form).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["message"], "Internal server error");
    assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
    assert!(server.stored_files().is_empty());
}

#[tokio::test]
async fn non_multipart_body_is_a_handled_server_error() {
    let server = TestServer::spawn(FakeDetector::labelling(&["Cat"])).await;
    let response = server
        .http
        .post(server.url("/api/upload"))
        .body("plain text")
        .send()
        .await
        .expect("upload request");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn oversized_upload_is_refused_before_classification() {
    let detector = FakeDetector::labelling(&["Cat"]);
    let server = TestServer::spawn_with_limit(detector.clone(), 1024).await;

    let form = Form::new().part(
        "image",
        Part::bytes(vec![0u8; 64 * 1024])
            .file_name("huge.png")
            .mime_str("image/png")
            .expect("mime"),
    );
    let (status, body) = server.upload(form).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["message"], "File too large");
    assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
    assert!(server.stored_files().is_empty());
}

#[tokio::test]
async fn classifier_failure_keeps_nothing_on_disk() {
    let detector = FakeDetector::failing();
    let server = TestServer::spawn(detector.clone()).await;

    let (status, body) = server.upload(image_form(PNG_BYTES)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["message"], "Internal server error");
    assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    assert!(server.stored_files().is_empty());
}

#[tokio::test]
async fn ui_bundle_is_served_outside_the_api() {
    let server = TestServer::spawn(FakeDetector::labelling(&["Cat"])).await;

    let index = server
        .http
        .get(server.url("/"))
        .send()
        .await
        .expect("index");
    assert_eq!(index.status(), StatusCode::OK);
    assert_eq!(
        index
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/html; charset=utf-8")
    );
    assert!(index.text().await.expect("html").contains("CatBook"));

    let missing = server
        .http
        .get(server.url("/static/js/missing.js"))
        .send()
        .await
        .expect("missing asset");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}
