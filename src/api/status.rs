//! Public status endpoint (`GET /status`, client port).
//!
//! Safe to expose publicly without authentication. Returns broker liveness
//! and aggregate traffic metrics only — never account handles, provider
//! handles, model names, or anything that could be used to fingerprint a
//! specific participant.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::router::RouterState;

/// `GET /status` — public liveness and metrics endpoint.
///
/// Example response:
/// ```json
/// {
///   "status": "ok",
///   "uptime_secs": 3600,
///   "active_providers": 4,
///   "requests": {
///     "total": 1024,
///     "errors": 3,
///     "error_rate": 0.003,
///     "avg_latency_ms": 87.4
///   }
/// }
/// ```
pub async fn status(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let uptime_secs = state.started_at.elapsed().as_secs();
    let stats = state.traffic.stats().await;
    let error_rate = if stats.total_requests == 0 {
        0.0_f64
    } else {
        stats.error_count as f64 / stats.total_requests as f64
    };

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime_secs,
        "active_providers": state.registry.len(),
        "requests": {
            "total": stats.total_requests,
            "errors": stats.error_count,
            "error_rate": error_rate,
            "avg_latency_ms": stats.avg_latency_ms,
        }
    }))
}
