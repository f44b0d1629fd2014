//! HTTP routes for the key pool
//!
//! Endpoints:
//! - GET /: welcome banner
//! - GET /generate_keys: create a new batch, JSON array of keys
//! - GET /get_available_key: lease a key, plain text
//! - GET /unblock_key?key=K: release a leased key
//! - GET /delete_key?key=K: delete a leased key
//! - GET /keep_alive_refresh?key=K: renew a key's lifetime
//! - GET /get_stats: JSON dump of queue, leased set and records
//! - GET /health: liveness with key counts
//! - GET /metrics: Prometheus exposition

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;

use key_pool::{Key, KeyPool, PoolStats};

use crate::error::ApiError;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<KeyPool>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` bounds the number of requests handled concurrently.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route("/generate_keys", get(generate_keys))
        .route("/get_available_key", get(get_available_key))
        .route("/unblock_key", get(unblock_key))
        .route("/delete_key", get(delete_key))
        .route("/keep_alive_refresh", get(keep_alive_refresh))
        .route("/get_stats", get(get_stats))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(axum::middleware::from_fn(crate::metrics::track_requests))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct KeyQuery {
    key: Option<String>,
}

impl KeyQuery {
    fn require(self) -> Result<String, ApiError> {
        self.key
            .filter(|k| !k.is_empty())
            .ok_or(ApiError::MissingKey)
    }
}

async fn welcome() -> &'static str {
    "Welcome to Key Server!"
}

async fn generate_keys(State(state): State<AppState>) -> Json<Vec<Key>> {
    Json(state.pool.generate().await)
}

async fn get_available_key(State(state): State<AppState>) -> Result<String, ApiError> {
    Ok(state.pool.lease().await?.to_string())
}

async fn unblock_key(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
) -> Result<String, ApiError> {
    let key = query.require()?;
    state.pool.release(&key).await?;
    Ok(format!("unblocked => {key}"))
}

async fn delete_key(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
) -> Result<String, ApiError> {
    let key = query.require()?;
    state.pool.delete(&key).await?;
    Ok(format!("deleted => {key}"))
}

async fn keep_alive_refresh(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
) -> Result<String, ApiError> {
    let key = query.require()?;
    state
        .pool
        .keep_alive(&key)
        .await
        .map_err(ApiError::KeepAlive)?;
    Ok(format!("refreshed => {key}"))
}

async fn get_stats(State(state): State<AppState>) -> Json<PoolStats> {
    Json(state.pool.stats().await)
}

/// Liveness plus a summary of pool occupancy.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let counts = state.pool.counts().await;
    Json(serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "keys_total": counts.total,
        "keys_available": counts.available,
        "keys_leased": counts.leased,
    }))
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{KEY_EXPIRED, KEY_NOT_ASSIGNED, NO_KEYS_LEFT};
    use axum::body::Body;
    use axum::http::Request;
    use key_pool::PoolSettings;
    use std::time::Duration;
    use tower::ServiceExt;

    /// PrometheusHandle without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn test_app(batch_size: usize) -> Router {
        let pool = Arc::new(KeyPool::new(PoolSettings {
            batch_size,
            lease_duration: Duration::from_secs(60),
            key_lifetime: Duration::from_secs(300),
        }));
        let state = AppState {
            pool,
            prometheus: test_prometheus_handle(),
            started_at: Instant::now(),
        };
        build_router(state, 1000)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn generate(app: &Router) -> Vec<String> {
        let (status, body) = get(app, "/generate_keys").await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_str(&body).unwrap()
    }

    #[tokio::test]
    async fn welcome_banner() {
        let app = test_app(2);
        let (status, body) = get(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Welcome to Key Server!");
    }

    #[tokio::test]
    async fn generate_keys_returns_json_batch() {
        let app = test_app(3);
        let keys = generate(&app).await;
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|k| k.len() == 32));
    }

    #[tokio::test]
    async fn get_available_key_on_empty_pool() {
        let app = test_app(2);
        let (status, body) = get(&app, "/get_available_key").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, NO_KEYS_LEFT);
    }

    #[tokio::test]
    async fn lease_release_delete_flow() {
        let app = test_app(2);
        let keys = generate(&app).await;

        let (status, leased) = get(&app, "/get_available_key").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(leased, keys[0]);

        let (status, body) = get(&app, &format!("/unblock_key?key={leased}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, format!("unblocked => {leased}"));

        // Released keys are no longer leased, so delete is refused
        let (status, body) = get(&app, &format!("/delete_key?key={leased}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, KEY_NOT_ASSIGNED);

        // Queue is now [B, A]; lease B then delete it
        let (_, second) = get(&app, "/get_available_key").await;
        assert_eq!(second, keys[1]);
        let (status, body) = get(&app, &format!("/delete_key?key={second}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, format!("deleted => {second}"));
    }

    #[tokio::test]
    async fn unblock_unknown_key_is_not_assigned() {
        let app = test_app(2);
        let (status, body) = get(&app, "/unblock_key?key=random_key").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, KEY_NOT_ASSIGNED);
    }

    #[tokio::test]
    async fn missing_key_parameter_is_bad_request() {
        let app = test_app(2);
        for uri in [
            "/unblock_key",
            "/delete_key",
            "/keep_alive_refresh",
            "/unblock_key?key=",
        ] {
            let (status, _) = get(&app, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "for {uri}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_refresh_live_and_expired() {
        let app = test_app(2);
        let keys = generate(&app).await;

        let (status, body) = get(&app, &format!("/keep_alive_refresh?key={}", keys[0])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, format!("refreshed => {}", keys[0]));

        tokio::time::advance(Duration::from_secs(301)).await;
        let (status, body) = get(&app, &format!("/keep_alive_refresh?key={}", keys[1])).await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body, KEY_EXPIRED);

        // The expired key is gone for good
        let (status, body) = get(&app, &format!("/keep_alive_refresh?key={}", keys[1])).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, KEY_EXPIRED);

        let (status, body) = get(&app, "/keep_alive_refresh?key=random_key").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, KEY_EXPIRED);
    }

    #[tokio::test]
    async fn get_stats_dumps_collections() {
        let app = test_app(3);
        let keys = generate(&app).await;
        let (_, leased) = get(&app, "/get_available_key").await;

        let (status, body) = get(&app, "/get_stats").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["available"], serde_json::json!([keys[1], keys[2]]));
        assert_eq!(json["blocked"], serde_json::json!([leased]));
        assert_eq!(json["keys"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let app = test_app(4);
        generate(&app).await;
        get(&app, "/get_available_key").await;

        let (status, body) = get(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["keys_total"], 4);
        assert_eq!(json["keys_available"], 3);
        assert_eq!(json["keys_leased"], 1);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_format() {
        let app = test_app(2);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[axum::http::header::CONTENT_TYPE]
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let app = test_app(2);
        let (status, _) = get(&app, "/no_such_route").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
