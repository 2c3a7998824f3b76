//! Client- and provider-facing API: chat completions, the model catalog,
//! account self-service (balance, transactions, stats), and the provider
//! WebSocket upgrade.
//!
//! This is intentionally a thin layer: all routing logic lives in
//! [`crate::dispatcher::Dispatcher`]. Handlers translate HTTP concerns
//! (status codes, JSON bodies, query params) into dispatcher/ledger/registry
//! calls and back.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::client_auth::{client_auth_middleware, ConsumerAccount};
use crate::error::{AppError, BrokerError};
use crate::protocol::ChatCompletionRequest;
use crate::router::RouterState;
use crate::session;
use crate::traffic::TrafficEntry;

/// Build the client- and provider-facing axum router (client port).
///
/// `/healthz`, `/status`, and the provider WebSocket upgrade are reachable
/// without a consumer API key — the upgrade authenticates the provider
/// itself via its `register` message (§4.6), and the other two are
/// intentionally public (Docker healthcheck, public status page). Every
/// `/v1/*` consumer endpoint requires [`client_auth_middleware`].
pub fn router(state: Arc<RouterState>) -> Router {
    let session_state = state.session_state();

    let public = Router::new()
        .route("/healthz", get(crate::api::health::healthz))
        .route("/status", get(crate::api::status::status))
        .route("/v1/providers/ws", get(session::provider_ws).with_state(session_state));

    let protected = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(models))
        .route("/v1/balance", get(balance))
        .route("/v1/transactions", get(transactions))
        .route("/v1/provider/stats", get(provider_stats))
        .route("/v1/consumer/stats", get(consumer_stats))
        .layer(axum::middleware::from_fn_with_state(state.clone(), client_auth_middleware));

    public.merge(protected).with_state(state)
}

/// `POST /v1/chat/completions` — classify, select a provider, forward, and
/// settle (§4.5), recording a [`TrafficEntry`] regardless of outcome.
async fn chat_completions(
    State(state): State<Arc<RouterState>>,
    Extension(ConsumerAccount(consumer)): Extension<ConsumerAccount>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<impl IntoResponse, AppError> {
    if request.stream {
        return Err(AppError::from(BrokerError::InvalidModel));
    }

    let requested_model = request.model.clone();
    let start = std::time::Instant::now();
    let result = state.dispatcher.route(consumer, request).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    let mut entry = TrafficEntry::new(latency_ms, result.is_ok())
        .with_consumer(&consumer.handle())
        .with_requested_model(&requested_model);

    match &result {
        Ok(response) => {
            entry = entry
                .with_tier(&response.model_tier.to_string())
                .with_provider(&response.provider_id)
                .with_mule_amount(response.usage.mule_amount);
        }
        Err(err) => entry = entry.with_error(&err.to_string()),
    }
    state.traffic.push(entry);

    result.map(Json).map_err(AppError::from)
}

/// `GET /v1/models` — the live catalog (§4.5, §6).
async fn models(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    Json(state.dispatcher.catalog())
}

#[derive(Serialize)]
struct BalanceResponse {
    account: String,
    mules: Decimal,
}

/// `GET /v1/balance` — the caller's own MULE balance.
async fn balance(
    State(state): State<Arc<RouterState>>,
    Extension(ConsumerAccount(consumer)): Extension<ConsumerAccount>,
) -> Result<impl IntoResponse, AppError> {
    let tokenomics = state.config().tokenomics();
    let mules = state.dispatcher.ledger().get_balance(consumer, &tokenomics).await?;
    Ok(Json(BalanceResponse { account: consumer.handle(), mules }))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

/// `GET /v1/transactions` — the caller's own ledger history, newest first.
async fn transactions(
    State(state): State<Arc<RouterState>>,
    Extension(ConsumerAccount(consumer)): Extension<ConsumerAccount>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, AppError> {
    let limit = query.limit.unwrap_or(50).min(500);
    let txs = state.dispatcher.ledger().transactions_for(consumer, limit).await?;
    Ok(Json(txs))
}

#[derive(Serialize)]
struct ProviderSessionView {
    session_id: String,
    models: Vec<String>,
    status: &'static str,
    ready_for_requests: bool,
    in_flight: u32,
    avg_tokens_per_second: f64,
    last_heartbeat_seconds_ago: f64,
}

impl From<crate::registry::ProviderView> for ProviderSessionView {
    fn from(view: crate::registry::ProviderView) -> Self {
        Self {
            session_id: view.session_id.to_string(),
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
        }
    }
}

/// `GET /v1/provider/stats` — the caller's own live provider sessions, if any.
async fn provider_stats(
    State(state): State<Arc<RouterState>>,
    Extension(ConsumerAccount(consumer)): Extension<ConsumerAccount>,
) -> impl IntoResponse {
    let sessions: Vec<ProviderSessionView> =
        state.registry.sessions_for_account(consumer).into_iter().map(ProviderSessionView::from).collect();
    Json(sessions)
}

#[derive(Serialize)]
struct ConsumerStats {
    total_requests: usize,
    error_count: usize,
    avg_latency_ms: f64,
    total_mule_spent: Decimal,
}

/// `GET /v1/consumer/stats` — the caller's own request history, derived from
/// the traffic log rather than the ledger (so it reflects failed requests too).
async fn consumer_stats(
    State(state): State<Arc<RouterState>>,
    Extension(ConsumerAccount(consumer)): Extension<ConsumerAccount>,
) -> impl IntoResponse {
    let handle = consumer.handle();
    let entries = state.traffic.recent(usize::MAX).await;
    let mine: Vec<_> = entries.into_iter().filter(|e| e.consumer.as_deref() == Some(handle.as_str())).collect();

    let total_requests = mine.len();
    let error_count = mine.iter().filter(|e| !e.success).count();
    let avg_latency_ms = if total_requests == 0 {
        0.0
    } else {
        mine.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total_requests as f64
    };
    let total_mule_spent = mine.iter().filter_map(|e| e.mule_amount).sum();

    Json(ConsumerStats { total_requests, error_count, avg_latency_ms, total_mule_spent })
}
