//! Admin API — operator-facing introspection endpoints.
//!
//! These endpoints are separated onto a different port so they can be
//! network-restricted independently of the client/provider API (e.g.
//! accessible only from the internal network, never exposed publicly).

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::router::RouterState;

/// Build the admin-facing axum router.
pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/admin/health", get(health))
        .route("/admin/providers", get(providers))
        .route("/admin/reconciliation", get(reconciliation))
        .route("/admin/traffic", get(traffic))
        .route("/admin/config", get(config))
        .route("/metrics", get(crate::api::metrics::metrics))
        .with_state(state)
}

/// `GET /admin/health` — liveness plus a coarse view of broker load.
async fn health(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "active_providers": state.registry.len(),
        "accounts_configured": state.api_keys.len(),
    }))
}

#[derive(Serialize)]
struct ProviderRow {
    session_id: String,
    account: Option<String>,
    models: Vec<String>,
    status: &'static str,
    ready_for_requests: bool,
    in_flight: u32,
    avg_tokens_per_second: f64,
    last_heartbeat_seconds_ago: f64,
    registered_seconds_ago: f64,
}

/// `GET /admin/providers` — a raw snapshot of every live provider session
/// (§3, §5). Unlike `/v1/provider/stats`, this is not scoped to a caller.
async fn providers(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let now = std::time::Instant::now();
    let rows: Vec<ProviderRow> = state
        .registry
        .list_active()
        .into_iter()
        .map(|view| ProviderRow {
            session_id: view.session_id.to_string(),
            account: view.account_id.map(|a| a.handle()),
            models: view.models,
            status: match view.status {
                crate::registry::SessionStatus::Active => "active",
                crate::registry::SessionStatus::Inactive => "inactive",
                crate::registry::SessionStatus::Connecting => "connecting",
            },
            ready_for_requests: view.ready_for_requests,
            in_flight: view.in_flight,
            avg_tokens_per_second: view.tps_ewma,
            last_heartbeat_seconds_ago: view.last_heartbeat_secs_ago,
            registered_seconds_ago: now.saturating_duration_since(view.registered_at).as_secs_f64(),
        })
        .collect();
    Json(rows)
}

/// `GET /admin/reconciliation` — settlements that succeeded on the client
/// side but failed to post to the ledger (§4.3 failure semantics).
async fn reconciliation(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    Json(state.dispatcher.reconciliation().snapshot().await)
}

#[derive(Deserialize)]
struct TrafficQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}
fn default_limit() -> usize {
    100
}

/// `GET /admin/traffic?limit=N` — recent traffic entries plus aggregate stats.
async fn traffic(State(state): State<Arc<RouterState>>, Query(q): Query<TrafficQuery>) -> impl IntoResponse {
    let entries = state.traffic.recent(q.limit).await;
    let stats = state.traffic.stats().await;
    Json(json!({ "stats": stats, "entries": entries }))
}

/// `GET /admin/config` — the live config, with account credentials shown
/// only by their `key_env` name, never the resolved secret value.
async fn config(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let cfg = state.config();
    let accounts: Vec<_> = cfg
        .accounts
        .iter()
        .map(|a| json!({ "key_env": a.key_env, "account_id": a.account_id }))
        .collect();

    Json(json!({
        "gateway": {
            "client_port": cfg.gateway.client_port,
            "admin_port": cfg.gateway.admin_port,
            "traffic_log_capacity": cfg.gateway.traffic_log_capacity,
            "rate_limit_rpm": cfg.gateway.rate_limit_rpm,
            "allow_anonymous_providers": cfg.gateway.allow_anonymous_providers,
            "ping_interval_secs": cfg.gateway.ping_interval_secs,
            "heartbeat_timeout_secs": cfg.gateway.heartbeat_timeout_secs,
            "load_threshold": cfg.gateway.load_threshold,
            "default_request_timeout_secs": cfg.gateway.default_request_timeout_secs,
            "max_request_timeout_secs": cfg.gateway.max_request_timeout_secs,
        },
        "tokenomics": cfg.tokenomics,
        "accounts": accounts,
    }))
}
