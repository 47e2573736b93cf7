//! HTTP surface of the daemon.
//!
//! Routes and JSON shapes stay compatible with existing face-registration
//! clients: multipart uploads in, `{"error": ...}` bodies on failure.

use crate::engine::EngineError;
use crate::service::{IdentityService, ServiceError};
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mugshot_core::PipelineError;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

type AppState = Arc<IdentityService>;

/// Build the router over `service`; request bodies above `max_upload_bytes` are refused.
pub fn router(service: Arc<IdentityService>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/recognize", post(recognize))
        .route("/recognize-multi", post(recognize))
        .route("/get_users", get(get_users))
        .route("/users/{username}/images", get(user_images))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Multipart(MultipartError),
    Service(ServiceError),
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self::Service(e)
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        Self::Multipart(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Multipart(e) => (e.status(), e.body_text()),
            ApiError::Service(e) => service_error_response(e),
        };

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %message, "request rejected");
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn service_error_response(e: ServiceError) -> (StatusCode, String) {
    match e {
        ServiceError::MissingUsername => (StatusCode::BAD_REQUEST, "Username is required".into()),
        ServiceError::ImageCount { expected, got } => (
            StatusCode::BAD_REQUEST,
            format!("Expected {expected} images, got {got}"),
        ),
        ServiceError::Engine(EngineError::Pipeline(PipelineError::NoFaceDetected(i))) => {
            (StatusCode::BAD_REQUEST, format!("No face detected in image {i}"))
        }
        ServiceError::Engine(EngineError::Pipeline(PipelineError::InvalidImage(_))) => {
            (StatusCode::BAD_REQUEST, "Invalid image".into())
        }
        e @ ServiceError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, e.to_string()),
        e => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn register(
    State(service): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut username = None;
    let mut images: HashMap<usize, Vec<u8>> = HashMap::new();

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        if name == "username" {
            username = Some(field.text().await?);
        } else if let Some(slot) = name.strip_prefix("image").and_then(|n| n.parse().ok()) {
            images.insert(slot, field.bytes().await?.to_vec());
        }
    }

    let username = username.ok_or_else(|| ApiError::BadRequest("Username is required".into()))?;
    let expected = service.settings().enroll_images;
    let ordered = (0..expected)
        .map(|i| {
            images
                .remove(&i)
                .ok_or_else(|| ApiError::BadRequest(format!("Missing image{i}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let id = service.enroll(&username, ordered).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "User registered successfully!", "id": id })),
    ))
}

async fn recognize(
    State(service): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut image = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("image") {
            image = Some(field.bytes().await?.to_vec());
            break;
        }
    }

    let image = image.ok_or_else(|| ApiError::BadRequest("No image provided".into()))?;
    let results = service.recognize(image).await?;
    Ok(Json(results))
}

async fn get_users(State(service): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let users = service.list_identities().await?;
    let count = users.len();
    Ok(Json(json!({ "users": users, "count": count })))
}

async fn user_images(
    State(service): State<AppState>,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stored_image = service
        .thumbnail(&username)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;
    Ok(Json(json!({ "stored_image": stored_image })))
}

async fn status(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::service::ServiceSettings;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use mugshot_core::testing::{strips_png, FakeExtractor, StripLocator, BLUE, RED};
    use mugshot_core::{FacePipeline, Identity, IdentityId, NewIdentity};
    use mugshot_store::{IdentityStore, MemoryStore, StoreError};
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "mugshot-test-boundary";

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, Vec<u8>),
    }

    fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                            .as_bytes(),
                    );
                }
                Part::File(name, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{name}.png\"\r\n\
                             Content-Type: image/png\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(bytes);
                    body.extend_from_slice(b"\r\n");
                }
            }
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn post_multipart(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn registration(username: &str, images: Vec<Vec<u8>>) -> Request<Body> {
        let mut parts = vec![Part::Text("username", username)];
        let names: Vec<String> = (0..images.len()).map(|i| format!("image{i}")).collect();
        for (name, bytes) in names.iter().zip(images) {
            parts.push(Part::File(name, bytes));
        }
        post_multipart("/register", &parts)
    }

    fn app_with(store: Arc<dyn IdentityStore>, settings: ServiceSettings, limit: usize) -> Router {
        let engine = spawn_engine(FacePipeline::new(StripLocator, FakeExtractor::default())).unwrap();
        router(Arc::new(IdentityService::new(store, engine, settings)), limit)
    }

    fn app() -> Router {
        app_with(Arc::new(MemoryStore::new()), ServiceSettings::default(), 1024 * 1024)
    }

    async fn json_body(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_register_list_recognize() {
        let app = app();

        let response = app
            .clone()
            .oneshot(registration("alice", vec![strips_png(&[RED]); 5]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["message"], "User registered successfully!");
        assert!(body["id"].is_string());

        let response = app.clone().oneshot(get("/get_users")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "users": ["alice"], "count": 1 }));

        let response = app
            .clone()
            .oneshot(post_multipart("/recognize", &[Part::File("image", strips_png(&[RED, BLUE]))]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let results = json_body(response).await;
        let results = results.as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["name"], "alice");
        assert!((results[0]["probability"].as_f64().unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(results[1]["name"], "Unknown");
        assert!(results[1].get("id").is_none());
    }

    #[tokio::test]
    async fn test_user_images_returns_stored_thumbnail() {
        let app = app();
        let response = app.clone().oneshot(get("/users/alice/images")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await, json!({ "error": "User not found" }));

        app.clone()
            .oneshot(registration("alice", vec![strips_png(&[RED]); 5]))
            .await
            .unwrap();

        let response = app.oneshot(get("/users/alice/images")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let stored = body["stored_image"].as_str().unwrap();
        // Base64 of a JPEG starts with the SOI marker FF D8.
        assert!(stored.starts_with("/9j/"), "{stored}");
    }

    #[tokio::test]
    async fn test_register_names_faceless_image() {
        let app = app();
        let mut images = vec![strips_png(&[RED]); 5];
        images[2] = strips_png(&[]);

        let response = app.clone().oneshot(registration("alice", images)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            json!({ "error": "No face detected in image 2" })
        );

        let response = app.oneshot(get("/get_users")).await.unwrap();
        assert_eq!(json_body(response).await, json!({ "users": [], "count": 0 }));
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_image() {
        let mut images = vec![strips_png(&[RED]); 5];
        images[4] = b"GIF89a-but-not-really".to_vec();
        let response = app().oneshot(registration("alice", images)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await, json!({ "error": "Invalid image" }));
    }

    #[tokio::test]
    async fn test_register_missing_fields() {
        let response = app()
            .oneshot(registration("alice", vec![strips_png(&[RED]); 4]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await, json!({ "error": "Missing image4" }));

        let response = app()
            .oneshot(post_multipart("/register", &[Part::File("image0", strips_png(&[RED]))]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await, json!({ "error": "Username is required" }));
    }

    #[tokio::test]
    async fn test_recognize_without_image() {
        for uri in ["/recognize", "/recognize-multi"] {
            let response = app()
                .oneshot(post_multipart(uri, &[Part::Text("other", "x")]))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(json_body(response).await, json!({ "error": "No image provided" }));
        }
    }

    #[tokio::test]
    async fn test_recognize_invalid_image() {
        let response = app()
            .oneshot(post_multipart("/recognize", &[Part::File("image", b"nope".to_vec())]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await, json!({ "error": "Invalid image" }));
    }

    #[tokio::test]
    async fn test_recognize_multi_with_empty_store() {
        let response = app()
            .oneshot(post_multipart(
                "/recognize-multi",
                &[Part::File("image", strips_png(&[RED, BLUE]))],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!([{ "name": "No registered faces", "probability": 0.0 }])
        );
    }

    #[tokio::test]
    async fn test_status() {
        let response = app().oneshot(get("/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["identities"], 0);
        assert_eq!(body["threshold"], 0.7);
        assert_eq!(body["enroll_images"], 5);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_cors_is_permissive() {
        let request = Request::builder()
            .uri("/get_users")
            .header(header::ORIGIN, "http://localhost:3000")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }

    #[tokio::test]
    async fn test_upload_limit() {
        let app = app_with(Arc::new(MemoryStore::new()), ServiceSettings::default(), 256);
        let response = app
            .oneshot(post_multipart("/recognize", &[Part::File("image", vec![0u8; 4096])]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    struct StalledStore;

    #[async_trait]
    impl IdentityStore for StalledStore {
        async fn insert(&self, _identity: NewIdentity) -> Result<IdentityId, StoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(IdentityId::new("never"))
        }

        async fn load_all(&self) -> Result<Vec<Identity>, StoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }

        async fn usernames(&self) -> Result<Vec<String>, StoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }

        async fn thumbnail(&self, _username: &str) -> Result<Option<String>, StoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_store_timeout_maps_to_gateway_timeout() {
        let settings = ServiceSettings {
            store_timeout: Duration::from_millis(20),
            ..ServiceSettings::default()
        };
        let response = app_with(Arc::new(StalledStore), settings, 1024)
            .oneshot(get("/get_users"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(json_body(response).await["error"].is_string());
    }
}
