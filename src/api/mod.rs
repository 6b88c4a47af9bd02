//! Read-only API over the three stored blobs.
//!
//! Handlers are stateless and never write; each path maps to one KV key
//! with its own caching policy. `/api/realtime` supports conditional GETs
//! via a weak ETag derived from the stored feed timestamp.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tracing::error;

use crate::kv::{KvError, KvStore, REALTIME_STATUS_KEY, SCHEDULE_DATA_KEY, SCHEDULE_META_KEY};

const CACHE_SCHEDULE: &str = "public, max-age=3600";
const CACHE_META: &str = "public, max-age=60";
const CACHE_REALTIME: &str = "public, max-age=30";

#[derive(Clone)]
struct ApiState {
    kv: Arc<dyn KvStore>,
}

pub fn router(kv: Arc<dyn KvStore>) -> Router {
    let state = ApiState { kv };
    Router::new()
        .route(
            "/api/schedule",
            get(get_schedule).options(preflight).fallback(not_found),
        )
        .route(
            "/api/meta",
            get(get_meta).options(preflight).fallback(not_found),
        )
        .route(
            "/api/realtime",
            get(get_realtime).options(preflight).fallback(not_found),
        )
        .fallback(fallback)
        .with_state(state)
}

async fn get_schedule(State(state): State<ApiState>) -> Response {
    serve_blob(&state, SCHEDULE_DATA_KEY, CACHE_SCHEDULE, "No schedule data").await
}

/// Serves the schedule metadata, augmented with `realtimeAge` (seconds
/// since the last realtime feed timestamp) when a live status exists.
async fn get_meta(State(state): State<ApiState>) -> Response {
    let entry = match state.kv.get(SCHEDULE_META_KEY).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return not_found_json("No schedule metadata"),
        Err(e) => return internal_error(e),
    };
    let mut meta: serde_json::Value = match serde_json::from_slice(&entry.value) {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "Stored schedule metadata is not valid JSON");
            return json_message(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
        }
    };

    let realtime_timestamp = match state.kv.get(REALTIME_STATUS_KEY).await {
        Ok(entry) => entry
            .and_then(|e| e.metadata)
            .and_then(|m| m.get("t").and_then(|t| t.as_u64())),
        Err(_) => None,
    };
    if let (Some(t), Some(object)) = (realtime_timestamp, meta.as_object_mut()) {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        object.insert("realtimeAge".to_string(), json!(now.saturating_sub(t)));
    }

    (
        StatusCode::OK,
        base_headers(CACHE_META),
        meta.to_string(),
    )
        .into_response()
}

async fn get_realtime(State(state): State<ApiState>, request_headers: HeaderMap) -> Response {
    let entry = match state.kv.get(REALTIME_STATUS_KEY).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return not_found_json("No realtime data"),
        Err(e) => return internal_error(e),
    };

    let etag = entry
        .metadata
        .as_ref()
        .and_then(|m| m.get("t"))
        .and_then(|t| t.as_u64())
        .map(|t| format!("W/\"{}\"", t));

    let mut headers = base_headers(CACHE_REALTIME);
    if let Some(value) = etag.as_deref().and_then(|e| HeaderValue::from_str(e).ok()) {
        headers.insert(header::ETAG, value);
    }

    let if_none_match = request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());
    if let (Some(etag), Some(candidate)) = (etag.as_deref(), if_none_match) {
        if candidate == etag {
            headers.remove(header::CONTENT_TYPE);
            return (StatusCode::NOT_MODIFIED, headers).into_response();
        }
    }

    (StatusCode::OK, headers, entry.value).into_response()
}

async fn serve_blob(
    state: &ApiState,
    key: &str,
    cache_control: &'static str,
    missing_message: &str,
) -> Response {
    match state.kv.get(key).await {
        Ok(Some(entry)) => (StatusCode::OK, base_headers(cache_control), entry.value).into_response(),
        Ok(None) => not_found_json(missing_message),
        Err(e) => internal_error(e),
    }
}

/// 204 preflight with permissive CORS, for any `/api/*` path.
async fn preflight() -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    (StatusCode::NO_CONTENT, headers).into_response()
}

/// Unknown paths: 404 text, except OPTIONS under `/api/` which still gets
/// the permissive preflight.
async fn fallback(method: Method, uri: Uri) -> Response {
    if method == Method::OPTIONS && uri.path().starts_with("/api/") {
        return preflight().await;
    }
    not_found().await
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not found").into_response()
}

fn base_headers(cache_control: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(cache_control),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers
}

fn json_message(status: StatusCode, message: &str) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    (status, headers, json!({ "error": message }).to_string()).into_response()
}

fn not_found_json(message: &str) -> Response {
    json_message(StatusCode::NOT_FOUND, message)
}

fn internal_error(e: KvError) -> Response {
    error!(error = %e, "KV read failed");
    json_message(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
}
