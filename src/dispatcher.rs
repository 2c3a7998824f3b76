//! Dispatcher.
//!
//! Ties the other four components together: classify the request, pre-check
//! the consumer's balance, select a provider from the registry, forward a
//! correlated request over its write handle, await the matching response,
//! and settle the usage. The pending-request table and its oneshot-based
//! correlation machinery is the same shape as a request/response router
//! over a duplex transport in general — one map keyed by a fresh id, one
//! waiter per entry, released on every terminal path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::classifier::{self, Selector, Tier};
use crate::error::BrokerError;
use crate::ledger::{LedgerStore, ReconciliationEntry, ReconciliationLog, Usage};
use crate::model::{AccountId, CorrelationId, Performance, SessionId};
use crate::protocol::{ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ProviderMessage, UsageInfo};
use crate::registry::{ProviderRegistry, ProviderView};
use crate::tokenomics::{self, Tokenomics};

/// Load above which a provider is no longer selected for new work (§4.5 step 3).
pub const LOAD_THRESHOLD: u32 = 5;

/// What arrives on a pending request's oneshot channel.
enum PendingOutcome {
    Response(crate::protocol::RawChatCompletion),
    /// The bound session was removed (disconnect, timeout, write failure).
    SessionLost,
}

struct PendingSlot {
    session_id: SessionId,
    tx: oneshot::Sender<PendingOutcome>,
}

/// Releases a reserved `in_flight` slot and drops the pending-request entry
/// on every terminal path, *including* the client disconnecting mid-request
/// (the axum handler drops the `route` future while it's suspended inside
/// `forward_and_await`'s timeout await) — §5's resource-scoping requirement
/// ("all three are released on every terminal path") needs this to run from
/// `Drop`, not a plain statement after the `.await` that a cancellation
/// would skip entirely.
struct Reservation<'a> {
    registry: &'a ProviderRegistry,
    session_id: SessionId,
    pending: &'a Mutex<HashMap<CorrelationId, PendingSlot>>,
    correlation_id: CorrelationId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.registry.release(self.session_id);
        self.pending.lock().unwrap().remove(&self.correlation_id);
    }
}

pub struct DispatcherConfig {
    pub load_threshold: u32,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            load_threshold: LOAD_THRESHOLD,
            default_timeout: Duration::from_secs(180),
            max_timeout: Duration::from_secs(300),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    ledger: Arc<dyn LedgerStore>,
    reconciliation: Arc<ReconciliationLog>,
    tokenomics: Tokenomics,
    config: DispatcherConfig,
    pending: Mutex<HashMap<CorrelationId, PendingSlot>>,
}

/// One catalog row for `GET /v1/models`: a (model, provider-handle) pair
/// with aggregated performance (§6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct CatalogEntry {
    pub model: String,
    pub tier: Tier,
    pub context_length: u32,
    pub provider_handle: String,
    pub success_rate: f64,
    pub total_requests: usize,
    pub avg_tokens_per_second: f64,
    pub max_tokens_per_second: f64,
    pub last_active_seconds_ago: f64,
    pub status: &'static str,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        ledger: Arc<dyn LedgerStore>,
        reconciliation: Arc<ReconciliationLog>,
        tokenomics: Tokenomics,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            ledger,
            reconciliation,
            tokenomics,
            config,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    pub fn reconciliation(&self) -> &Arc<ReconciliationLog> {
        &self.reconciliation
    }

    pub fn tokenomics(&self) -> &Tokenomics {
        &self.tokenomics
    }

    /// `route` — the ten-step algorithm of §4.5.
    pub async fn route(
        &self,
        consumer: AccountId,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, BrokerError> {
        // 1. Classify.
        let selector = classifier::parse_selector(&request.model).ok_or(BrokerError::InvalidModel)?;
        let cap = classifier::classify(&request.model).ok_or(BrokerError::InvalidModel)?;

        // 2. Pre-check balance.
        let balance = self
            .ledger
            .get_balance(consumer, &self.tokenomics)
            .await
            .map_err(|_| BrokerError::Internal)?;
        // §8 boundary: `max_tokens == 0` is treated the same as absent —
        // the estimate falls back to the context window either way.
        let estimate_tokens = request.max_tokens.filter(|&m| m > 0).unwrap_or(cap.context) as i64;
        let estimate = tokenomics::tokens_to_mules(estimate_tokens, cap.tier, &self.tokenomics);
        if balance < estimate {
            return Err(BrokerError::InsufficientBalance { required: estimate, available: balance });
        }

        // 3 & 4. Filter eligible, compatible providers; short-circuit if empty.
        // §4.5 step 3's predicate is literal: status=active, not merely
        // "not yet removed" — a session demoted to `Inactive` by the
        // heartbeat sweep is excluded here rather than scored down (see
        // DESIGN.md's Open Question decision reconciling this against
        // §4.5.2's "deprioritized" language).
        let snapshot = self.registry.list_active();
        let mut candidates: Vec<(ProviderView, String)> = snapshot
            .into_iter()
            .filter(|v| {
                v.status == crate::registry::SessionStatus::Active
                    && v.ready_for_requests
                    && !v.write_handle.is_closed()
                    && v.in_flight < self.config.load_threshold
            })
            .filter_map(|v| resolve_on_provider(&selector, &v).map(|resolved| (v, resolved)))
            .collect();

        if candidates.is_empty() {
            return Err(BrokerError::NoProviderAvailable);
        }

        // 5. Score, tie-break by first-registered.
        candidates.sort_by(|(a, _), (b, _)| {
            let score_a = score(a, self.config.load_threshold);
            let score_b = score(b, self.config.load_threshold);
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.registered_at.cmp(&b.registered_at))
        });
        let (chosen, resolved_model) = candidates.into_iter().next().expect("checked non-empty above");

        // 6. Reserve, allocate correlation id.
        self.registry.reserve(chosen.session_id);
        let correlation_id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            correlation_id,
            PendingSlot { session_id: chosen.session_id, tx },
        );
        // Guards the reservation above for the rest of this call, including
        // early return via `?` and the caller dropping this future outright.
        let reservation = Reservation {
            registry: &self.registry,
            session_id: chosen.session_id,
            pending: &self.pending,
            correlation_id,
        };

        let start = Instant::now();
        let outcome = self
            .forward_and_await(&chosen, correlation_id, &request, rx)
            .await;

        // 9. Release in_flight / the pending slot now (rather than waiting
        // for end-of-scope) so the bookkeeping invariant holds before we
        // record the performance sample and settle.
        drop(reservation);
        let duration = start.elapsed().as_secs_f64();

        let raw = match outcome {
            Ok(raw) => raw,
            Err(err) => {
                self.registry.record_sample(
                    chosen.session_id,
                    Performance { duration_seconds: duration, tokens_per_second: 0.0, success: false },
                );
                return Err(err);
            }
        };

        let first_choice_has_content = raw
            .choices
            .first()
            .map(|c| !c.message.content.is_empty())
            .unwrap_or(false);
        if !first_choice_has_content {
            self.registry.record_sample(
                chosen.session_id,
                Performance { duration_seconds: duration, tokens_per_second: 0.0, success: false },
            );
            return Err(BrokerError::ProviderBadResponse);
        }

        let total_tokens = raw.usage.prompt_tokens + raw.usage.completion_tokens;
        let usage = Usage {
            prompt_tokens: raw.usage.prompt_tokens,
            completion_tokens: raw.usage.completion_tokens,
            total_tokens,
        };
        let tokens_per_second = if duration > 0.0 { total_tokens as f64 / duration } else { 0.0 };
        let performance = Performance { duration_seconds: duration, tokens_per_second, success: true };
        self.registry.record_sample(chosen.session_id, performance);

        // A response already reached the client's provider; a settlement
        // failure here must never fail the request back to the consumer —
        // it's logged for reconciliation instead (§4.3 failure semantics).
        let mule_amount = tokenomics::tokens_to_mules(total_tokens as i64, cap.tier, &self.tokenomics);
        let settled = self
            .ledger
            .settle(
                consumer,
                chosen.account_id,
                &resolved_model,
                cap.tier,
                usage,
                Some(performance),
                &self.tokenomics,
            )
            .await;
        let mule_amount = match settled {
            Ok(tx) => tx.mule_amount,
            Err(e) => {
                self.reconciliation
                    .push(ReconciliationEntry {
                        recorded_at: chrono::Utc::now(),
                        consumer,
                        provider: chosen.account_id,
                        amount: mule_amount,
                        reason: e.to_string(),
                    })
                    .await;
                mule_amount
            }
        };

        // 10. Return, enriched.
        let consumer_cost = if chosen.account_id == Some(consumer) {
            // Self-service: the legacy source reports zero estimated cost to
            // the caller even while the transaction records the full amount.
            rust_decimal::Decimal::ZERO
        } else {
            mule_amount
        };

        Ok(ChatCompletionResponse {
            id: raw.id.unwrap_or_else(|| correlation_id.to_string()),
            model: resolved_model,
            choices: raw.choices,
            model_tier: cap.tier,
            provider_id: chosen.account_id.map(|a| a.handle()).unwrap_or_else(|| chosen.session_id.to_string()),
            usage: UsageInfo {
                mule_amount,
                duration_seconds: duration,
                tokens_per_second,
                transaction_mule_cost: consumer_cost,
            },
        })
    }

    async fn forward_and_await(
        &self,
        chosen: &ProviderView,
        correlation_id: CorrelationId,
        request: &ChatCompletionRequest,
        rx: oneshot::Receiver<PendingOutcome>,
    ) -> Result<crate::protocol::RawChatCompletion, BrokerError> {
        // 7. Forward.
        let message = ProviderMessage::CompletionRequest {
            id: correlation_id.0,
            model: request.model.clone(),
            messages: request.messages.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };
        if chosen.write_handle.send(message).await.is_err() {
            return Err(BrokerError::ProviderTransportError);
        }

        // 8. Await, bounded by the request's T_req (default/override, hard-capped).
        let timeout = request
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_timeout)
            .min(self.config.max_timeout);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(PendingOutcome::Response(raw))) => Ok(raw),
            Ok(Ok(PendingOutcome::SessionLost)) => Err(BrokerError::ProviderTransportError),
            Ok(Err(_)) => Err(BrokerError::ProviderTransportError),
            Err(_) => Err(BrokerError::ProviderTimeout),
        }
    }

    /// Called by the Session Layer's demux when a `completion_response`
    /// arrives. Unknown correlation ids are logged and dropped (§4.6).
    pub fn complete_request(&self, correlation_id: CorrelationId, response: crate::protocol::RawChatCompletion) {
        let slot = self.pending.lock().unwrap().remove(&correlation_id);
        match slot {
            Some(slot) => {
                let _ = slot.tx.send(PendingOutcome::Response(response));
            }
            None => {
                tracing::debug!(%correlation_id, "completion_response for unknown or already-resolved correlation id");
            }
        }
    }

    /// Called by the Session Layer when a session is removed: fails every
    /// pending request bound to it with `PROVIDER_TRANSPORT_ERROR`,
    /// satisfying the liveness property in §8.
    pub fn fail_pending_for_session(&self, session_id: SessionId) {
        let mut pending = self.pending.lock().unwrap();
        let dead: Vec<CorrelationId> = pending
            .iter()
            .filter(|(_, slot)| slot.session_id == session_id)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(slot) = pending.remove(&id) {
                let _ = slot.tx.send(PendingOutcome::SessionLost);
            }
        }
    }

    /// `GET /v1/models` catalog: one row per (model, provider-handle) pair,
    /// sorted by tier (xl > large > medium > small) then descending average
    /// tokens/sec (§6).
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        let mut rows: Vec<CatalogEntry> = self
            .registry
            .list_active()
            .into_iter()
            .flat_map(|view| {
                let handle = view
                    .account_id
                    .map(|a| a.handle())
                    .unwrap_or_else(|| view.session_id.to_string());
                let status = match view.status {
                    crate::registry::SessionStatus::Active => "active",
                    crate::registry::SessionStatus::Inactive => "inactive",
                    crate::registry::SessionStatus::Connecting => "connecting",
                };
                view.models
                    .iter()
                    .filter_map(|m| classifier::classify(m).map(|cap| (m.clone(), cap)))
                    .map(|(model, cap)| CatalogEntry {
                        model,
                        tier: cap.tier,
                        context_length: cap.context,
                        provider_handle: handle.clone(),
                        success_rate: view.success_rate,
                        total_requests: view.total_requests,
                        avg_tokens_per_second: view.tps_ewma,
                        max_tokens_per_second: view.max_tps,
                        last_active_seconds_ago: view.last_heartbeat_secs_ago,
                        status,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        rows.sort_by(|a, b| {
            tier_rank(b.tier)
                .cmp(&tier_rank(a.tier))
                .then(b.avg_tokens_per_second.partial_cmp(&a.avg_tokens_per_second).unwrap_or(std::cmp::Ordering::Equal))
        });
        rows
    }
}

fn tier_rank(tier: Tier) -> u8 {
    match tier {
        Tier::Xl => 3,
        Tier::Large => 2,
        Tier::Medium => 1,
        Tier::Small => 0,
    }
}

/// §4.5 step 5's score formula.
fn score(view: &ProviderView, load_threshold: u32) -> f64 {
    let load_term = 1.0 - (view.in_flight as f64 / load_threshold as f64);
    let perf_term = (view.tps_ewma / 100.0).min(1.0);
    0.6 * load_term + 0.4 * perf_term
}

/// Model compatibility (§4.5.1): returns the provider-local model identifier
/// to forward if `selector` is satisfiable against this provider's
/// advertised models, `None` otherwise.
fn resolve_on_provider(selector: &Selector, view: &ProviderView) -> Option<String> {
    match selector {
        Selector::Tier(tier) => view
            .models
            .iter()
            .find(|m| classifier::classify(m).map(|c| c.tier) == Some(*tier))
            .cloned(),
        Selector::Combined(tier, sub) => view
            .models
            .iter()
            .find(|m| classifier::classify(m).map(|c| c.tier) == Some(*tier) && m.to_lowercase().contains(sub.as_str()))
            .cloned(),
        Selector::Addressed(model, handle) => {
            let provider_handle = view.account_id?.handle();
            if &provider_handle != handle {
                return None;
            }
            view.models
                .iter()
                .find(|m| classifier::normalize(m) == classifier::normalize(model))
                .cloned()
        }
        Selector::Exact(model) => view
            .models
            .iter()
            .find(|m| classifier::normalize(m) == classifier::normalize(model))
            .cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryStore;
    use crate::protocol::ChatMessage;
    use tokio::sync::mpsc;

    fn dispatcher() -> (Dispatcher, Arc<ProviderRegistry>, Arc<InMemoryStore>) {
        let registry = Arc::new(ProviderRegistry::new());
        let ledger = InMemoryStore::new();
        let dispatcher = Dispatcher::new(
            registry.clone(),
            ledger.clone(),
            Arc::new(ReconciliationLog::new()),
            Tokenomics::default(),
            DispatcherConfig::default(),
        );
        (dispatcher, registry, ledger)
    }

    fn request(model: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage { role: "user".into(), content: "hi".into() }],
            temperature: None,
            max_tokens: Some(100),
            timeout_seconds: None,
            stream: false,
        }
    }

    #[tokio::test]
    async fn invalid_model_fails_fast() {
        let (dispatcher, _registry, _ledger) = dispatcher();
        let consumer = AccountId::new();
        let err = dispatcher.route(consumer, request("bogus-tier|llama")).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidModel));
    }

    #[tokio::test]
    async fn no_provider_available_when_registry_empty() {
        let (dispatcher, _registry, _ledger) = dispatcher();
        let consumer = AccountId::new();
        let err = dispatcher.route(consumer, request("mistral:7b")).await.unwrap_err();
        assert!(matches!(err, BrokerError::NoProviderAvailable));
    }

    #[tokio::test]
    async fn insufficient_balance_is_checked_before_selection() {
        let (dispatcher, registry, _ledger) = dispatcher();
        let (tx, _rx) = mpsc::channel(8);
        registry.register(SessionId::new(), None, vec!["mistral:7b".into()], tx);

        let consumer = AccountId::new();
        let mut req = request("small");
        req.max_tokens = Some(1_000_000);
        let err = dispatcher.route(consumer, req).await.unwrap_err();
        assert!(matches!(err, BrokerError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn scoring_prefers_lower_load_and_higher_throughput() {
        let (_dispatcher, registry, _ledger) = dispatcher();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        let p1 = SessionId::new();
        let p2 = SessionId::new();
        registry.register(p1, None, vec!["mistral:7b".into()], tx1);
        registry.register(p2, None, vec!["mistral:7b".into()], tx2);

        for _ in 0..3 {
            registry.reserve(p1);
        }
        registry.record_sample(p1, Performance { duration_seconds: 1.0, tokens_per_second: 40.0, success: true });
        registry.record_sample(p2, Performance { duration_seconds: 1.0, tokens_per_second: 10.0, success: true });

        let v1 = registry.get(p1).unwrap();
        let v2 = registry.get(p2).unwrap();
        let s1 = score(&v1, LOAD_THRESHOLD);
        let s2 = score(&v2, LOAD_THRESHOLD);
        assert!((s1 - 0.40).abs() < 1e-9);
        assert!((s2 - 0.64).abs() < 1e-9);
        assert!(s2 > s1);
    }

    #[tokio::test]
    async fn complete_request_resolves_pending_waiter() {
        let (dispatcher, registry, _ledger) = dispatcher();
        let (tx, mut rx) = mpsc::channel(8);
        let session = SessionId::new();
        registry.register(session, None, vec!["mistral:7b".into()], tx);

        let consumer = AccountId::new();
        let req = request("mistral:7b");

        let route_fut = dispatcher.route(consumer, req);
        tokio::pin!(route_fut);

        // Drive the forwarded message out of the channel, then reply.
        let forwarded = tokio::select! {
            msg = rx.recv() => msg,
            _ = &mut route_fut => panic!("route resolved before a response was sent"),
        };
        let ProviderMessage::CompletionRequest { id, .. } = forwarded.unwrap() else {
            panic!("expected completion_request");
        };

        dispatcher.complete_request(
            CorrelationId(id),
            crate::protocol::RawChatCompletion {
                id: Some("resp-1".into()),
                model: Some("mistral:7b".into()),
                choices: vec![ChatChoice { index: 0, message: ChatMessage { role: "assistant".into(), content: "hello".into() }, finish_reason: None }],
                usage: crate::protocol::RawUsage { prompt_tokens: 10, completion_tokens: 10, total_tokens: 0 },
            },
        );

        let response = route_fut.await.unwrap();
        assert_eq!(response.usage.mule_amount, tokenomics::tokens_to_mules(20, Tier::Medium, &Tokenomics::default()));
    }
}
