//! Prometheus metrics endpoint

use axum::http::StatusCode;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder; safe to call once at startup
pub fn init_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = HANDLE.set(handle.clone());
            Some(handle)
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install metrics recorder");
            None
        }
    }
}

/// GET /metrics
pub async fn metrics_handler() -> Result<String, StatusCode> {
    HANDLE
        .get()
        .map(|handle| handle.render())
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}
