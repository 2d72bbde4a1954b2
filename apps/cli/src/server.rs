//! HTTP ingestion endpoint and the `serve` process (API + relay loop).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::eyre::{Result, WrapErr};
use serde_json::{Value, json};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use moood_core::{Pipeline, ingest, parse_entry_payload};
use moood_shared::{CorsConfig, Entry, EntryId, MooodError};
use moood_storage::{ProcessedRecord, Storage};

#[derive(Clone)]
pub(crate) struct AppState {
    storage: Arc<Storage>,
}

/// Build the API router.
pub(crate) fn router(storage: Arc<Storage>, cors: &CorsConfig) -> Router {
    let router = Router::new()
        .route("/entries", post(create_entry))
        .route("/entries/:id", get(show_entry))
        .route("/health", get(health));

    let router = match cors_layer(cors) {
        Some(layer) => router.layer(layer),
        None => router,
    };
    router.with_state(AppState { storage })
}

/// `None` when no origins are configured.
fn cors_layer(config: &CorsConfig) -> Option<CorsLayer> {
    if config.allowed_origins.is_empty() {
        return None;
    }

    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::AUTHORIZATION])
        .max_age(Duration::from_secs(config.max_age_seconds));

    if config.allowed_origins.iter().any(|origin| origin == "*") {
        return Some(layer.allow_origin(Any));
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    Some(layer.allow_origin(origins))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /entries
async fn create_entry(
    State(state): State<AppState>,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> Response {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, &rejection.body_text());
        }
    };

    let created = match parse_entry_payload(&body) {
        Ok(text) => ingest(&state.storage, &text).await,
        Err(e) => Err(e),
    };

    match created {
        Ok(entry) => (StatusCode::CREATED, Json(entry_document(&entry, None))).into_response(),
        Err(e) => pipeline_error(&e),
    }
}

/// GET /entries/:id
///
/// 200 once processed, 202 while still waiting for the relay.
async fn show_entry(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = EntryId::from(id);

    match state.storage.get_processed(&id).await {
        Ok(Some(record)) => {
            return (
                StatusCode::OK,
                Json(entry_document(&record.processed.entry, Some(&record))),
            )
                .into_response();
        }
        Ok(None) => {}
        Err(e) => return pipeline_error(&e),
    }

    match state.storage.get_entry(&id).await {
        Ok(Some(entry)) => (StatusCode::ACCEPTED, Json(entry_document(&entry, None))).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, &format!("entry {id} not found")),
        Err(e) => pipeline_error(&e),
    }
}

/// GET /health
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

fn entry_document(entry: &Entry, processed: Option<&ProcessedRecord>) -> Value {
    let mut attributes = json!({
        "entry": entry.text,
        "createdAt": entry.created_at,
    });
    if let Some(record) = processed {
        attributes["metadata"] = json!(record.processed.metadata);
        attributes["processedAt"] = json!(record.processed_at);
    }

    json!({
        "data": {
            "type": "entry",
            "id": entry.id,
            "attributes": attributes,
        }
    })
}

fn error_response(status: StatusCode, detail: &str) -> Response {
    let body = json!({
        "errors": [{
            "status": status.as_u16(),
            "title": status.canonical_reason().unwrap_or("Error"),
            "detail": detail,
        }]
    });
    (status, Json(body)).into_response()
}

fn pipeline_error(err: &MooodError) -> Response {
    if err.is_client_error() {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }
    error!(error = %err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

// ---------------------------------------------------------------------------
// Serve
// ---------------------------------------------------------------------------

/// Run the API and the relay loop until Ctrl-C.
pub(crate) async fn serve(pipeline: Pipeline, bind: &str, cors: &CorsConfig) -> Result<()> {
    // Pin the relay's read position before any request can ingest
    pipeline
        .relay
        .activate()
        .await
        .wrap_err("failed to activate relay")?;

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .wrap_err_with(|| format!("failed to bind {bind}"))?;
    info!(%bind, workers = pipeline.registry.len(), "serving ingestion API");
    println!("Listening on http://{bind}");

    let app = router(pipeline.storage.clone(), cors);
    let (stop_tx, stop_rx) = watch::channel(false);

    let relay_stop = stop_rx.clone();
    let relay = tokio::spawn(async move { pipeline.relay.run(stopped(relay_stop)).await });

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(stopped(stop_rx))
        .await;
    if served.is_err() {
        relay.abort();
    }
    served.wrap_err("server error")?;

    let stats = relay.await?;
    info!(
        processed = stats.processed,
        failed_batches = stats.failed_batches,
        "shutdown complete"
    );
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Resolves on Ctrl-C.
pub(crate) async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => warn!(error = %e, "failed to listen for Ctrl+C, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use moood_shared::{EntryMetadata, ProcessedEntry};
    use tower::ServiceExt;
    use uuid::Uuid;

    fn app(storage: Arc<Storage>) -> Router {
        router(storage, &CorsConfig::default())
    }

    async fn test_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("moood_api_{}.db", Uuid::now_v7()));
        Arc::new(Storage::open(&tmp).await.expect("open test db"))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/entries")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn create_entry_returns_201_and_stores() {
        let storage = test_storage().await;
        let (status, body) = send(
            app(storage.clone()),
            post_json(r#"{"entry":"I feel great today"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["type"], "entry");
        assert_eq!(body["data"]["attributes"]["entry"], "I feel great today");
        assert!(body["data"]["attributes"]["createdAt"].is_string());

        let id = body["data"]["id"].as_str().unwrap();
        assert!(storage.get_entry(&id.into()).await.unwrap().is_some());
        assert_eq!(storage.pending_changes(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bad_payloads_return_400_and_store_nothing() {
        let storage = test_storage().await;

        for payload in [r#"{"entry":""}"#, r#"{}"#, r#"{"entry":7}"#, "not json"] {
            let (status, body) = send(app(storage.clone()), post_json(payload)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "payload {payload}");
            assert_eq!(body["errors"][0]["status"], 400);
            assert_eq!(body["errors"][0]["title"], "Bad Request");
            assert!(body["errors"][0]["detail"].is_string());
        }
        assert_eq!(storage.pending_changes(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn show_entry_reflects_processing_state() {
        let storage = test_storage().await;
        let entry = Entry::new("I feel great today");
        storage.insert_entry(&entry).await.unwrap();
        let uri = format!("/entries/{}", entry.id);

        let (status, body) = send(app(storage.clone()), get(&uri)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["data"]["attributes"].get("metadata").is_none());

        let mut metadata = EntryMetadata::new();
        metadata.insert("sentiment", json!({"score": 0.8}));
        storage
            .upsert_processed(&ProcessedEntry {
                entry: entry.clone(),
                metadata,
            })
            .await
            .unwrap();

        let (status, body) = send(app(storage.clone()), get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["data"]["attributes"]["metadata"],
            json!({"sentiment": {"score": 0.8}})
        );
    }

    #[tokio::test]
    async fn unknown_entry_is_404() {
        let (status, body) = send(app(test_storage().await), get("/entries/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errors"][0]["status"], 404);
    }

    #[tokio::test]
    async fn json_api_request_body_is_accepted() {
        let storage = test_storage().await;
        let (status, body) = send(
            app(storage.clone()),
            post_json(r#"{"data":{"type":"entry","attributes":{"entry":"I feel great today"}}}"#),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["attributes"]["entry"], "I feel great today");
        assert_eq!(storage.pending_changes(None).await.unwrap(), 1);
    }

    fn preflight(origin: &str) -> Request<Body> {
        Request::builder()
            .method("OPTIONS")
            .uri("/entries")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn cors_preflight_allows_any_origin_by_default() {
        let response = app(test_storage().await)
            .oneshot(preflight("https://journal.example"))
            .await
            .unwrap();

        assert!(response.status().is_success());
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let methods = headers[header::ACCESS_CONTROL_ALLOW_METHODS].to_str().unwrap();
        assert!(methods.contains("POST"), "methods: {methods}");
        assert!(methods.contains("DELETE"), "methods: {methods}");
        assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "3600");
    }

    #[tokio::test]
    async fn cors_restricted_to_configured_origins() {
        let cors = CorsConfig {
            allowed_origins: vec!["https://journal.example".into()],
            max_age_seconds: 60,
        };

        let allowed = router(test_storage().await, &cors)
            .oneshot(preflight("https://journal.example"))
            .await
            .unwrap();
        assert_eq!(
            allowed.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://journal.example"
        );

        let denied = router(test_storage().await, &cors)
            .oneshot(preflight("https://elsewhere.example"))
            .await
            .unwrap();
        assert!(!denied.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn cors_disabled_with_no_origins() {
        let cors = CorsConfig {
            allowed_origins: Vec::new(),
            max_age_seconds: 60,
        };
        let response = router(test_storage().await, &cors)
            .oneshot(preflight("https://journal.example"))
            .await
            .unwrap();
        assert!(!response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = send(app(test_storage().await), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body["version"].is_string());
    }
}
