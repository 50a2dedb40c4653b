use axum::{
    extract::{
        multipart::{Field, MultipartRejection},
        DefaultBodyLimit, Multipart, Query, State,
    },
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use ktp_ocr::{ExtractionSchema, KtpPipeline, OcrBackend, ScanOutcome, SchemaKind};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::ServerConfig;
use crate::error::ApiError;

/// Room for multipart boundaries and headers around the image itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub struct AppState {
    pipeline: KtpPipeline<Box<dyn OcrBackend>>,
    detailed: ExtractionSchema,
    minimal: ExtractionSchema,
    request_timeout: Duration,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn from_config(config: &ServerConfig, recognizer: Box<dyn OcrBackend>) -> anyhow::Result<Self> {
        let pipeline = KtpPipeline::new(recognizer, config.preprocess.clone(), config.ocr.clone())
            .with_temp_dir(config.temp_dir.clone());
        Ok(Self {
            pipeline,
            detailed: config.detailed_schema()?,
            minimal: ExtractionSchema::minimal(),
            request_timeout: config.request_timeout(),
            max_upload_bytes: config.max_upload_bytes,
        })
    }

    fn schema(&self, kind: SchemaKind) -> &ExtractionSchema {
        match kind {
            SchemaKind::Detailed => &self.detailed,
            SchemaKind::Minimal => &self.minimal,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_upload_bytes + MULTIPART_OVERHEAD;
    Router::new()
        .route("/health", get(health))
        .route("/api/ktp/scan", post(scan))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
struct ScanParams {
    schema: Option<String>,
}

async fn scan(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ScanParams>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ScanOutcome>, ApiError> {
    let kind = match params.schema.as_deref() {
        Some(name) => name.parse::<SchemaKind>().map_err(ApiError::Validation)?,
        None => SchemaKind::default(),
    };
    let mut multipart = multipart.map_err(|e| ApiError::Validation(e.body_text()))?;
    let data = read_image(&mut multipart, state.max_upload_bytes).await?;

    let request_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("scan", %request_id, schema = %kind, bytes = data.len());
    let worker = Arc::clone(&state);
    let task = tokio::task::spawn_blocking(move || {
        let _guard = span.enter();
        let outcome = worker.pipeline.scan(&data, worker.schema(kind));
        if let Ok(outcome) = &outcome {
            tracing::info!(matched = outcome.data.matched(), "scan finished");
        }
        outcome
    });

    match tokio::time::timeout(state.request_timeout, task).await {
        Ok(Ok(outcome)) => Ok(Json(outcome?)),
        Ok(Err(join)) => {
            tracing::error!(%request_id, error = %join, "scan task failed");
            Err(ApiError::Processing("scan task aborted".into()))
        }
        Err(_) => {
            tracing::warn!(%request_id, timeout = ?state.request_timeout, "scan timed out");
            Err(ApiError::Processing(format!(
                "scan timed out after {}s",
                state.request_timeout.as_secs()
            )))
        }
    }
}

/// Pull the `image` field out of the form, enforcing type and size.
async fn read_image(multipart: &mut Multipart, max_bytes: usize) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("image") {
            continue;
        }
        let is_image = field.content_type().is_some_and(|ct| ct.starts_with("image/"));
        if !is_image {
            return Err(ApiError::Validation("The image field must be an image.".into()));
        }
        return read_limited(field, max_bytes).await;
    }
    Err(ApiError::Validation("The image field is required.".into()))
}

async fn read_limited(mut field: Field<'_>, max_bytes: usize) -> Result<Vec<u8>, ApiError> {
    let mut data = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        if data.len() + chunk.len() > max_bytes {
            return Err(too_large(max_bytes));
        }
        data.extend_from_slice(&chunk);
    }
    if data.is_empty() {
        return Err(ApiError::Validation("The image field is required.".into()));
    }
    Ok(data)
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::Validation("The image is too large.".into())
    } else {
        ApiError::Validation(e.body_text())
    }
}

fn too_large(max_bytes: usize) -> ApiError {
    ApiError::Validation(format!(
        "The image may not be greater than {} kilobytes.",
        max_bytes / 1024
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
    use ktp_ocr::{MockRecognizer, OcrConfig, OcrError};
    use serde_json::Value;
    use std::io::Cursor;
    use std::path::Path;
    use tower::ServiceExt;

    const BOUNDARY: &str = "ktp-test-boundary";
    const KTP_TEXT: &str = "NIK : 3273012345670001\nNama : BUDI SANTOSO\nAlamat : JL. MAWAR NO. 1\nRT/RW : 001/002\nAgama : ISLAM";

    struct Failing;

    impl OcrBackend for Failing {
        fn recognize(&self, _image_path: &Path, _config: &OcrConfig) -> Result<String, OcrError> {
            Err(OcrError::Unavailable("tesseract not installed".into()))
        }
    }

    struct Slow;

    impl OcrBackend for Slow {
        fn recognize(&self, _image_path: &Path, _config: &OcrConfig) -> Result<String, OcrError> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(String::new())
        }
    }

    fn app_with(recognizer: Box<dyn OcrBackend>, config: ServerConfig) -> Router {
        let state = AppState::from_config(&config, recognizer).unwrap();
        router(Arc::new(state))
    }

    fn app() -> Router {
        app_with(Box::new(MockRecognizer::new(KTP_TEXT)), ServerConfig::default())
    }

    fn tiny_png() -> Vec<u8> {
        let img: GrayImage = ImageBuffer::from_fn(8, 4, |x, _| Luma([(x * 30) as u8]));
        let mut buf = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn multipart_body(field: &str, content_type: &str, data: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"ktp.png\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn scan_request(uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap()
    }

    async fn send_raw(app: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send_raw(app, request).await;
        (status, serde_json::from_str(&body).unwrap())
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"OK");
    }

    #[tokio::test]
    async fn scan_returns_detailed_record() {
        let body = multipart_body("image", "image/png", &tiny_png());
        let (status, json) = send(app(), scan_request("/api/ktp/scan", body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["raw_text"], KTP_TEXT);
        let data = json["data"].as_object().unwrap();
        assert_eq!(data.len(), 14);
        assert_eq!(data["nik"], "3273012345670001");
        assert_eq!(data["nama"], "BUDI SANTOSO");
        assert_eq!(data["rt_rw"], "001/002");
        assert_eq!(data["agama"], "ISLAM");
        assert!(data["pekerjaan"].is_null());
    }

    #[tokio::test]
    async fn scan_body_keeps_card_field_order() {
        let body = multipart_body("image", "image/png", &tiny_png());
        let (status, raw) = send_raw(app(), scan_request("/api/ktp/scan", body)).await;
        assert_eq!(status, StatusCode::OK);

        let position = |key: &str| raw.find(&format!("\"{key}\":")).unwrap();
        let order = ["nik", "nama", "tempat_tgl_lahir", "alamat", "rt_rw", "agama", "berlaku_hingga"];
        for pair in order.windows(2) {
            assert!(position(pair[0]) < position(pair[1]), "{} before {}", pair[0], pair[1]);
        }
    }

    #[tokio::test]
    async fn minimal_schema_via_query() {
        let body = multipart_body("image", "image/jpeg", &tiny_png());
        let (status, json) = send(app(), scan_request("/api/ktp/scan?schema=minimal", body)).await;

        assert_eq!(status, StatusCode::OK);
        let data = json["data"].as_object().unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data["alamat"], "JL. MAWAR NO. 1 RT/RW : 001/002");
    }

    #[tokio::test]
    async fn unknown_schema_is_validation_error() {
        let body = multipart_body("image", "image/png", &tiny_png());
        let (status, json) = send(app(), scan_request("/api/ktp/scan?schema=full", body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["error"], "Validation failed.");
        assert!(json["message"].as_str().unwrap().contains("full"));
    }

    #[tokio::test]
    async fn missing_image_field_is_validation_error() {
        let body = multipart_body("photo", "image/png", &tiny_png());
        let (status, json) = send(app(), scan_request("/api/ktp/scan", body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["message"], "The image field is required.");
    }

    #[tokio::test]
    async fn non_image_content_type_is_validation_error() {
        let body = multipart_body("image", "application/pdf", b"%PDF-1.4");
        let (status, json) = send(app(), scan_request("/api/ktp/scan", body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["message"], "The image field must be an image.");
    }

    #[tokio::test]
    async fn non_multipart_request_is_validation_error() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/ktp/scan")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, json) = send(app(), request).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["error"], "Validation failed.");
    }

    #[tokio::test]
    async fn oversized_upload_is_validation_error() {
        let config = ServerConfig { max_upload_bytes: 1024, ..Default::default() };
        let app = app_with(Box::new(MockRecognizer::new("")), config);
        let body = multipart_body("image", "image/png", &vec![0u8; 4096]);
        let (status, json) = send(app, scan_request("/api/ktp/scan", body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["message"], "The image may not be greater than 1 kilobytes.");
    }

    #[tokio::test]
    async fn corrupt_image_is_processing_error() {
        let body = multipart_body("image", "image/png", b"definitely not a png");
        let (status, json) = send(app(), scan_request("/api/ktp/scan", body)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "Failed to process KTP image.");
    }

    #[tokio::test]
    async fn ocr_unavailable_is_processing_error() {
        let app = app_with(Box::new(Failing), ServerConfig::default());
        let body = multipart_body("image", "image/png", &tiny_png());
        let (status, json) = send(app, scan_request("/api/ktp/scan", body)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["message"].as_str().unwrap().contains("tesseract not installed"));
    }

    #[tokio::test]
    async fn slow_ocr_hits_request_timeout() {
        let mut config = ServerConfig::default();
        config.ocr.timeout_ms = None;
        let mut state = AppState::from_config(&config, Box::new(Slow)).unwrap();
        state.request_timeout = Duration::from_millis(50);
        let app = router(Arc::new(state));

        let body = multipart_body("image", "image/png", &tiny_png());
        let (status, json) = send(app, scan_request("/api/ktp/scan", body)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["message"].as_str().unwrap().contains("timed out"));
    }
}
