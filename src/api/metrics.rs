//! Prometheus-compatible `/metrics` endpoint.
//!
//! All per-request metrics are derived from the in-memory ring-buffer
//! window, so they represent a **sliding window** of recent requests rather
//! than lifetime counters — values may decrease as old entries rotate out.
//! `TYPE gauge` is used throughout for that reason. Registry-derived gauges
//! (`llmule_active_providers`, `llmule_in_flight_requests`) reflect live state
//! instead.
//!
//! Metric families:
//! - `llmule_window_size`        — entries currently in the ring buffer
//! - `llmule_requests`           — per-tier/outcome request counts
//! - `llmule_latency_ms_sum`     — sum of latencies per tier (for avg)
//! - `llmule_latency_ms_count`   — denominator matching the sum above
//! - `llmule_errors_total`       — requests that returned an error
//! - `llmule_mule_volume_total`  — MULE amount settled, summed over the window
//! - `llmule_active_providers`   — live provider sessions right now
//! - `llmule_in_flight_requests` — sum of in-flight counts across providers

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::router::RouterState;

/// `GET /metrics` — renders Prometheus text format.
pub async fn metrics(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let entries = state.traffic.recent(usize::MAX).await;

    let window_size = entries.len();
    let mut errors: u64 = 0;
    let mut mule_volume = rust_decimal::Decimal::ZERO;

    // (tier, success) -> count
    let mut request_counts: HashMap<(String, bool), u64> = HashMap::new();
    // tier -> (latency_sum_ms, count)
    let mut latency: HashMap<String, (u64, u64)> = HashMap::new();

    for e in &entries {
        if !e.success {
            errors += 1;
        }
        if let Some(amount) = e.mule_amount {
            mule_volume += amount;
        }

        let tier = e.tier.clone().unwrap_or_else(|| "unknown".to_string());
        *request_counts.entry((tier.clone(), e.success)).or_default() += 1;

        let lat = latency.entry(tier).or_default();
        lat.0 += e.latency_ms;
        lat.1 += 1;
    }

    let active_providers = state.registry.len();
    let in_flight: u32 = state.registry.list_active().iter().map(|v| v.in_flight).sum();

    let mut out = String::with_capacity(1024);

    out.push_str("# HELP llmule_window_size Number of requests currently held in the ring-buffer window.\n");
    out.push_str("# TYPE llmule_window_size gauge\n");
    out.push_str(&format!("llmule_window_size {window_size}\n\n"));

    out.push_str("# HELP llmule_requests Request count in the current window, labelled by tier and outcome.\n");
    out.push_str("# TYPE llmule_requests gauge\n");
    let mut req_rows: Vec<_> = request_counts.iter().collect();
    req_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((tier, success), count) in req_rows {
        let success_str = if *success { "true" } else { "false" };
        out.push_str(&format!("llmule_requests{{tier=\"{tier}\",success=\"{success_str}\"}} {count}\n"));
    }
    out.push('\n');

    out.push_str("# HELP llmule_latency_ms_sum Sum of request latency (ms) in the current window, grouped by tier.\n");
    out.push_str("# TYPE llmule_latency_ms_sum gauge\n");
    out.push_str("# HELP llmule_latency_ms_count Number of observations for the latency sum above.\n");
    out.push_str("# TYPE llmule_latency_ms_count gauge\n");
    let mut lat_rows: Vec<_> = latency.iter().collect();
    lat_rows.sort_by(|a, b| a.0.cmp(b.0));
    for (tier, (sum, count)) in lat_rows {
        out.push_str(&format!("llmule_latency_ms_sum{{tier=\"{tier}\"}} {sum}\n"));
        out.push_str(&format!("llmule_latency_ms_count{{tier=\"{tier}\"}} {count}\n"));
    }
    out.push('\n');

    out.push_str("# HELP llmule_errors_total Requests that returned an error in the current window.\n");
    out.push_str("# TYPE llmule_errors_total gauge\n");
    out.push_str(&format!("llmule_errors_total {errors}\n\n"));

    out.push_str("# HELP llmule_mule_volume_total MULE amount settled across the current window.\n");
    out.push_str("# TYPE llmule_mule_volume_total gauge\n");
    out.push_str(&format!("llmule_mule_volume_total {mule_volume}\n\n"));

    out.push_str("# HELP llmule_active_providers Provider sessions currently registered.\n");
    out.push_str("# TYPE llmule_active_providers gauge\n");
    out.push_str(&format!("llmule_active_providers {active_providers}\n\n"));

    out.push_str("# HELP llmule_in_flight_requests Requests currently reserved against a provider.\n");
    out.push_str("# TYPE llmule_in_flight_requests gauge\n");
    out.push_str(&format!("llmule_in_flight_requests {in_flight}\n"));

    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], out)
}
