//! Inspection UI and REST API
//!
//! Separate HTTP listener serving the embedded single-page inspector, the
//! JSON API over the transcript store, the replay endpoint, HAR export and
//! the live SSE feed. Inspection-side errors surface as HTTP status codes
//! with a plain-text body.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{stream, Stream, StreamExt};
use rust_embed::RustEmbed;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::bus::EventBus;
use crate::error::StoreError;
use crate::har;
use crate::record::TranscriptRecord;
use crate::replay::{Replayer, ReplayResult};
use crate::store::TranscriptStore;

const DEFAULT_LIST_LIMIT: usize = 500;
const HAR_EXPORT_LIMIT: usize = 1000;

#[derive(RustEmbed)]
#[folder = "src/ui/assets"]
struct Assets;

/// State shared across handlers.
pub struct AppState {
    pub store: Arc<TranscriptStore>,
    pub bus: Arc<EventBus>,
    pub replayer: Replayer,
    /// Root CA PEM for download; absent when MITM is disabled.
    pub ca_cert_pem: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { Redirect::to("/ui/") }))
        .route("/ui", get(index))
        .route("/ui/", get(index))
        .route("/ui/{*path}", get(asset))
        .route("/api/entries", get(list_entries))
        .route("/api/entry/{id}", get(get_entry))
        .route("/api/replay/{id}", get(replay_entry))
        .route("/api/export/har", get(export_har))
        .route("/api/ca", get(ca_cert))
        .route("/api/clear", post(clear))
        .route("/events", get(events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    tracing::info!("inspection UI listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

type ApiError = (StatusCode, String);

fn store_error(err: StoreError) -> ApiError {
    if err.is_not_found() {
        (StatusCode::NOT_FOUND, err.to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

fn internal(err: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

async fn blocking<T, F>(task: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(internal)?
        .map_err(store_error)
}

#[derive(Deserialize)]
struct EntriesQuery {
    limit: Option<usize>,
}

async fn list_entries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EntriesQuery>,
) -> Result<Json<Vec<TranscriptRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let store = state.store.clone();
    let entries = blocking(move || store.list(limit)).await?;
    Ok(Json(entries))
}

async fn get_entry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TranscriptRecord>, ApiError> {
    let store = state.store.clone();
    let record = blocking(move || store.get(&id)).await?;
    Ok(Json(record))
}

async fn replay_entry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ReplayResult>, ApiError> {
    let store = state.store.clone();
    let record = blocking(move || store.get(&id)).await?;
    let result = state.replayer.replay(&record).await.map_err(internal)?;
    Ok(Json(result))
}

async fn export_har(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let store = state.store.clone();
    let entries = blocking(move || store.list(HAR_EXPORT_LIMIT)).await?;
    let document = har::from_records(&entries);
    let body = serde_json::to_string_pretty(&document).map_err(internal)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=httpeek.har",
            ),
        ],
        body,
    )
        .into_response())
}

async fn ca_cert(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    match &state.ca_cert_pem {
        Some(pem) => Ok((
            [
                (header::CONTENT_TYPE, "application/x-pem-file"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=httpeek-ca.pem",
                ),
            ],
            pem.clone(),
        )
            .into_response()),
        None => Err((
            StatusCode::NOT_FOUND,
            "MITM is disabled; no CA certificate".into(),
        )),
    }
}

async fn clear(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    blocking(move || store.clear()).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// SSE feed: an initial `ping`, then one `entry` event per committed record.
/// Dropping the response stream deregisters the subscriber.
async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.bus.subscribe();
    let ping = stream::once(async { Ok(Event::default().event("ping").data("ok")) });
    let entries = subscription.map(|record| {
        let data = serde_json::to_string(record.as_ref()).unwrap_or_else(|_| "{}".into());
        Ok(Event::default().event("entry").data(data))
    });
    Sse::new(ping.chain(entries))
}

async fn index() -> Response {
    serve_asset("index.html")
}

async fn asset(Path(path): Path<String>) -> Response {
    serve_asset(&path)
}

fn serve_asset(path: &str) -> Response {
    match Assets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            ([(header::CONTENT_TYPE, mime.as_ref())], content.data.to_vec()).into_response()
        }
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{HeaderPair, Scheme};
    use axum::body::Body;
    use axum::http::Request;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use chrono::Utc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn record(url: &str) -> TranscriptRecord {
        TranscriptRecord {
            id: String::new(),
            started_at: Utc::now(),
            duration_ms: 3,
            method: "GET".into(),
            url: url.into(),
            http_version: "HTTP/1.1".into(),
            host: "example.test".into(),
            scheme: Scheme::Http,
            req_headers: vec![HeaderPair::new("Accept", "*/*")],
            req_body: Vec::new(),
            req_body_trunc: false,
            status: 200,
            resp_headers: Vec::new(),
            resp_body: b"hello".to_vec(),
            resp_body_trunc: false,
            error: String::new(),
        }
    }

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState {
            store: Arc::new(TranscriptStore::open_in_memory().unwrap()),
            bus: Arc::new(EventBus::new()),
            replayer: Replayer::new(Duration::from_secs(5)).unwrap(),
            ca_cert_pem: None,
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn entries_lists_newest_first() {
        let state = test_state();
        for i in 0..3 {
            state
                .store
                .put(&mut record(&format!("http://example.test/{i}")))
                .unwrap();
        }
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/entries?limit=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let list = json.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["url"], "http://example.test/2");
    }

    #[tokio::test]
    async fn entry_by_id_and_missing_entry() {
        let state = test_state();
        let mut rec = record("http://example.test/one");
        let id = state.store.put(&mut rec).unwrap();

        let app = router(state);
        let found = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/entry/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);
        let json = body_json(found).await;
        assert_eq!(json["respBody"], STANDARD.encode(b"hello"));

        let missing = app
            .oneshot(
                Request::builder()
                    .uri("/api/entry/absent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn clear_empties_the_store() {
        let state = test_state();
        let id = state.store.put(&mut record("http://example.test/x")).unwrap();

        let app = router(state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/clear")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.store.get(&id).unwrap_err().is_not_found());
        assert!(state.store.list(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn har_export_round_trips_bodies() {
        let state = test_state();
        state.store.put(&mut record("http://example.test/h")).unwrap();

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/export/har")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["log"]["version"], "1.1");
        let text = json["log"]["entries"][0]["response"]["content"]["text"]
            .as_str()
            .unwrap();
        assert_eq!(STANDARD.decode(text).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn ca_endpoint_404s_without_mitm() {
        let response = router(test_state())
            .oneshot(Request::builder().uri("/api/ca").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ui_assets_are_embedded() {
        let app = router(test_state());
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/ui/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let root = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(root.status().is_redirection());
    }
}
