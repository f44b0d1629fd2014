//! Prometheus metrics exposition
//!
//! HTTP-level metrics recorded here:
//!
//! - `key_server_requests_total` (counter): labels `route`, `status`
//! - `key_server_request_duration_seconds` (histogram): label `route`
//!
//! Pool-level metrics (`key_pool_operations_total`, `key_pool_keys`,
//! `key_pool_keys_reclaimed_total`) are emitted by the `key-pool` crate and
//! rendered through the same recorder.

use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "key_server_request_duration_seconds";

/// Pool operations are in-memory, so buckets start well below a millisecond.
const DURATION_BUCKETS: &[f64] = &[
    0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record a completed request with its route and status code.
pub fn record_request(route: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "key_server_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(DURATION_METRIC, "route" => route.to_string()).record(duration_secs);
}

/// Middleware timing every request against its matched route.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    record_request(
        &route,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_request_does_not_panic_without_recorder() {
        record_request("/get_stats", 200, 0.001);
    }

    /// Isolated recorder/handle pair; only one global recorder may exist per process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("/get_available_key", 200, 0.0003);
        record_request("/get_available_key", 404, 0.0002);

        let output = handle.render();
        assert!(output.contains("key_server_requests_total"));
        assert!(output.contains("route=\"/get_available_key\""));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("status=\"404\""));
        assert!(
            output.contains("key_server_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
    }

    #[test]
    fn pool_metrics_render_through_the_same_recorder() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let pool = key_pool::KeyPool::new(key_pool::PoolSettings::default());
            pool.generate().await;
            pool.lease().await.unwrap();
            let _ = pool.delete("missing").await;
        });

        let output = handle.render();
        assert!(output.contains("key_pool_operations_total"));
        assert!(output.contains("operation=\"lease\""));
        assert!(output.contains("outcome=\"unknown\""));
        assert!(output.contains("key_pool_keys{state=\"available\"}"));
        assert!(output.contains("key_pool_keys{state=\"leased\"}"));
    }
}
