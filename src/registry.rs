//! Provider Registry.
//!
//! The long-lived in-memory catalog of connected providers: one entry per
//! live session, keyed by `SessionId`, plus an auxiliary index from
//! `AccountId` to its session ids. Per-entry mutable state is guarded by a
//! `std::sync::Mutex` so a concurrent reader/dispatcher never observes a
//! torn entry (§5) — the outer `DashMap` only protects the *set* of
//! entries, not what's inside one.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::model::{AccountId, Performance, SessionId};
use crate::protocol::ProviderMessage;

const PERFORMANCE_WINDOW: usize = 10;

/// Lifecycle state of a provider session (§4.5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Active,
    Inactive,
}

/// Outcome of a `register` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    AlreadyRegistered,
}

/// The mutable slice of a provider entry: everything that changes after
/// connect. Isolated behind its own lock so in-flight increments, heartbeat
/// refresh, and status transitions never race independently of each other.
struct MutableState {
    status: SessionStatus,
    ready_for_requests: bool,
    last_heartbeat: Instant,
    in_flight: u32,
    performance: VecDeque<Performance>,
}

impl MutableState {
    fn tps_ewma(&self) -> f64 {
        let successes: Vec<f64> = self
            .performance
            .iter()
            .filter(|p| p.success)
            .map(|p| p.tokens_per_second)
            .collect();
        if successes.is_empty() {
            return 0.0;
        }
        successes.iter().sum::<f64>() / successes.len() as f64
    }

    /// Highest observed tokens/sec among successful samples in the window.
    fn max_tps(&self) -> f64 {
        self.performance
            .iter()
            .filter(|p| p.success)
            .map(|p| p.tokens_per_second)
            .fold(0.0, f64::max)
    }

    /// Fraction of samples in the window that succeeded (§6 `success_rate`).
    fn success_rate(&self) -> f64 {
        if self.performance.is_empty() {
            return 1.0;
        }
        let successes = self.performance.iter().filter(|p| p.success).count();
        successes as f64 / self.performance.len() as f64
    }

    /// Samples currently held in the rolling window (§6 `total_requests`).
    fn total_requests(&self) -> usize {
        self.performance.len()
    }
}

/// One live provider connection (§3 "Provider entry").
pub struct ProviderEntry {
    pub session_id: SessionId,
    pub account_id: Option<AccountId>,
    pub models: Vec<String>,
    pub write_handle: mpsc::Sender<ProviderMessage>,
    pub registered_at: Instant,
    state: Mutex<MutableState>,
}

/// Read-only snapshot of a provider entry, safe to hold across an await
/// point without keeping the entry's lock or the registry's shard lock.
#[derive(Debug, Clone)]
pub struct ProviderView {
    pub session_id: SessionId,
    pub account_id: Option<AccountId>,
    pub models: Vec<String>,
    pub status: SessionStatus,
    pub ready_for_requests: bool,
    pub in_flight: u32,
    pub tps_ewma: f64,
    pub max_tps: f64,
    pub success_rate: f64,
    pub total_requests: usize,
    pub last_heartbeat_secs_ago: f64,
    pub registered_at: Instant,
    pub write_handle: mpsc::Sender<ProviderMessage>,
}

impl ProviderEntry {
    fn new(
        session_id: SessionId,
        account_id: Option<AccountId>,
        models: Vec<String>,
        write_handle: mpsc::Sender<ProviderMessage>,
    ) -> Self {
        Self {
            session_id,
            account_id,
            models,
            write_handle,
            registered_at: Instant::now(),
            state: Mutex::new(MutableState {
                status: SessionStatus::Active,
                ready_for_requests: true,
                last_heartbeat: Instant::now(),
                in_flight: 0,
                performance: VecDeque::with_capacity(PERFORMANCE_WINDOW),
            }),
        }
    }

    fn view(&self) -> ProviderView {
        let state = self.state.lock().unwrap();
        ProviderView {
            session_id: self.session_id,
            account_id: self.account_id,
            models: self.models.clone(),
            status: state.status,
            ready_for_requests: state.ready_for_requests,
            in_flight: state.in_flight,
            tps_ewma: state.tps_ewma(),
            max_tps: state.max_tps(),
            success_rate: state.success_rate(),
            total_requests: state.total_requests(),
            last_heartbeat_secs_ago: state.last_heartbeat.elapsed().as_secs_f64(),
            registered_at: self.registered_at,
            write_handle: self.write_handle.clone(),
        }
    }

    /// Atomically increment `in_flight` — the "reserve" step of §4.5 step 6.
    pub fn reserve(&self) {
        self.state.lock().unwrap().in_flight += 1;
    }

    /// Decrement `in_flight`, always paired with a terminal dispatch outcome.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    pub fn record_sample(&self, sample: Performance) {
        let mut state = self.state.lock().unwrap();
        if state.performance.len() >= PERFORMANCE_WINDOW {
            state.performance.pop_front();
        }
        state.performance.push_back(sample);
    }

    fn touch_heartbeat(&self) {
        let mut state = self.state.lock().unwrap();
        state.last_heartbeat = Instant::now();
        if state.status == SessionStatus::Inactive {
            state.status = SessionStatus::Active;
        }
    }

    fn mark_inactive(&self) {
        self.state.lock().unwrap().status = SessionStatus::Inactive;
    }

    fn seconds_since_heartbeat(&self) -> f64 {
        self.state.lock().unwrap().last_heartbeat.elapsed().as_secs_f64()
    }
}

/// The process-wide, explicitly-constructed provider catalog (§9 design
/// notes: "model it as an explicitly constructed object passed by
/// reference — not as ambient global mutable state").
pub struct ProviderRegistry {
    entries: DashMap<SessionId, ProviderEntry>,
    by_account: DashMap<AccountId, Vec<SessionId>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            by_account: DashMap::new(),
        }
    }

    /// Register a freshly-handshaken provider session. Idempotent: calling
    /// this again for an already-active session id returns
    /// `AlreadyRegistered` without duplicating state.
    pub fn register(
        &self,
        session_id: SessionId,
        account_id: Option<AccountId>,
        advertised_models: Vec<String>,
        write_handle: mpsc::Sender<ProviderMessage>,
    ) -> RegisterOutcome {
        if self.entries.contains_key(&session_id) {
            return RegisterOutcome::AlreadyRegistered;
        }

        let mut models = advertised_models;
        models.sort();
        models.dedup();

        if let Some(account) = account_id {
            self.by_account.entry(account).or_default().push(session_id);
        }

        self.entries.insert(
            session_id,
            ProviderEntry::new(session_id, account_id, models, write_handle),
        );
        RegisterOutcome::Registered
    }

    pub fn heartbeat(&self, session_id: SessionId) {
        if let Some(entry) = self.entries.get(&session_id) {
            entry.touch_heartbeat();
        }
    }

    /// Demote a session whose heartbeat is stale but not yet timed out
    /// (§4.4 heartbeat protocol's `T_timeout/3` threshold).
    pub fn mark_inactive(&self, session_id: SessionId) {
        if let Some(entry) = self.entries.get(&session_id) {
            entry.mark_inactive();
        }
    }

    /// Remove a session: closes out its registry footprint. The caller
    /// (Session Layer) is responsible for draining pending requests bound
    /// to this session and closing the write handle — the registry only
    /// owns the catalog, not the pending-request table (§9: two owned
    /// collections, no cross-pointers).
    pub fn remove(&self, session_id: SessionId) -> Option<ProviderEntry> {
        let removed = self.entries.remove(&session_id).map(|(_, entry)| entry);
        if let Some(entry) = &removed {
            if let Some(account) = entry.account_id {
                if let Some(mut sessions) = self.by_account.get_mut(&account) {
                    sessions.retain(|s| *s != session_id);
                }
            }
        }
        removed
    }

    pub fn get(&self, session_id: SessionId) -> Option<ProviderView> {
        self.entries.get(&session_id).map(|e| e.view())
    }

    /// Read-only snapshot of every session for selection filtering.
    pub fn list_active(&self) -> Vec<ProviderView> {
        self.entries.iter().map(|e| e.view()).collect()
    }

    pub fn record_sample(&self, session_id: SessionId, sample: Performance) {
        if let Some(entry) = self.entries.get(&session_id) {
            entry.record_sample(sample);
        }
    }

    pub fn reserve(&self, session_id: SessionId) {
        if let Some(entry) = self.entries.get(&session_id) {
            entry.reserve();
        }
    }

    pub fn release(&self, session_id: SessionId) {
        if let Some(entry) = self.entries.get(&session_id) {
            entry.release();
        }
    }

    /// Live sessions currently registered under an account, for `GET
    /// /v1/provider/stats`.
    pub fn sessions_for_account(&self, account: AccountId) -> Vec<ProviderView> {
        self.by_account
            .get(&account)
            .map(|sessions| sessions.iter().filter_map(|s| self.get(*s)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sweep every session against the heartbeat protocol (§4.4): past
    /// `t_timeout` → removed (returned for the caller to fail pending
    /// requests against); past `t_timeout / 3` → demoted to inactive.
    pub fn sweep_heartbeats(&self, t_timeout: Duration) -> Vec<SessionId> {
        let demote_after = t_timeout / 3;
        let mut to_remove = Vec::new();

        for entry in self.entries.iter() {
            let elapsed = entry.seconds_since_heartbeat();
            if elapsed > t_timeout.as_secs_f64() {
                to_remove.push(entry.session_id);
            } else if elapsed > demote_after.as_secs_f64() {
                entry.mark_inactive();
            }
        }

        for session_id in &to_remove {
            self.remove(*session_id);
        }
        to_remove
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> mpsc::Sender<ProviderMessage> {
        mpsc::channel(8).0
    }

    #[test]
    fn register_then_reregister_is_idempotent() {
        let registry = ProviderRegistry::new();
        let session = SessionId::new();
        let account = AccountId::new();

        let first = registry.register(session, Some(account), vec!["mistral:7b".into()], channel());
        assert_eq!(first, RegisterOutcome::Registered);

        let second = registry.register(session, Some(account), vec!["mistral:7b".into()], channel());
        assert_eq!(second, RegisterOutcome::AlreadyRegistered);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn advertised_models_are_deduplicated() {
        let registry = ProviderRegistry::new();
        let session = SessionId::new();
        registry.register(
            session,
            None,
            vec!["mistral:7b".into(), "mistral:7b".into(), "llama2-70b".into()],
            channel(),
        );
        let view = registry.get(session).unwrap();
        assert_eq!(view.models.len(), 2);
    }

    #[test]
    fn reserve_and_release_round_trip_in_flight() {
        let registry = ProviderRegistry::new();
        let session = SessionId::new();
        registry.register(session, None, vec![], channel());

        registry.reserve(session);
        registry.reserve(session);
        assert_eq!(registry.get(session).unwrap().in_flight, 2);

        registry.release(session);
        assert_eq!(registry.get(session).unwrap().in_flight, 1);
        registry.release(session);
        assert_eq!(registry.get(session).unwrap().in_flight, 0);
    }

    #[test]
    fn remove_purges_both_maps() {
        let registry = ProviderRegistry::new();
        let session = SessionId::new();
        let account = AccountId::new();
        registry.register(session, Some(account), vec![], channel());

        assert!(registry.remove(session).is_some());
        assert!(registry.get(session).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn tps_ewma_averages_only_successful_samples() {
        let registry = ProviderRegistry::new();
        let session = SessionId::new();
        registry.register(session, None, vec![], channel());

        registry.record_sample(session, Performance { duration_seconds: 1.0, tokens_per_second: 40.0, success: true });
        registry.record_sample(session, Performance { duration_seconds: 1.0, tokens_per_second: 0.0, success: false });
        registry.record_sample(session, Performance { duration_seconds: 1.0, tokens_per_second: 20.0, success: true });

        let view = registry.get(session).unwrap();
        assert_eq!(view.tps_ewma, 30.0);
    }

    #[test]
    fn performance_ring_trims_to_window_size() {
        let registry = ProviderRegistry::new();
        let session = SessionId::new();
        registry.register(session, None, vec![], channel());

        for i in 0..15 {
            registry.record_sample(
                session,
                Performance { duration_seconds: 1.0, tokens_per_second: i as f64, success: true },
            );
        }

        let view = registry.get(session).unwrap();
        // Average of the last 10 samples (5..=14): (5+...+14)/10 = 9.5
        assert_eq!(view.tps_ewma, 9.5);
    }

    #[test]
    fn heartbeat_refreshes_and_promotes_inactive() {
        let registry = ProviderRegistry::new();
        let session = SessionId::new();
        registry.register(session, None, vec![], channel());

        registry.mark_inactive(session);
        assert_eq!(registry.get(session).unwrap().status, SessionStatus::Inactive);

        registry.heartbeat(session);
        assert_eq!(registry.get(session).unwrap().status, SessionStatus::Active);
    }

    #[test]
    fn sweep_removes_only_past_hard_timeout() {
        let registry = ProviderRegistry::new();
        let session = SessionId::new();
        registry.register(session, None, vec![], channel());

        let removed = registry.sweep_heartbeats(Duration::from_secs(45));
        assert!(removed.is_empty());
        assert_eq!(registry.len(), 1);
    }
}
