//! Shared application state (§9 design notes: the broker's state is one
//! explicitly constructed object passed by reference through `axum::State`,
//! never ambient global mutable state).
//!
//! Mirrors the teacher's own `RouterState` shape — an atomically-swappable
//! live config behind a `RwLock<Arc<Config>>`, a traffic log, an optional
//! rate limiter, and an optional admin token — but wires it to the broker's
//! core: the provider registry and the dispatcher that ties registry, ledger,
//! and tokenomics together.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use crate::{
    api::rate_limit::RateLimiter,
    config::Config,
    dispatcher::Dispatcher,
    ledger::{InMemoryStore, LedgerStore, ReconciliationLog},
    model::AccountId,
    registry::ProviderRegistry,
    session::{HeartbeatConfig, SessionState, StaticKeyAuthenticator},
    traffic::TrafficLog,
};

/// Shared application state injected into every request handler via
/// [`axum::extract::State`].
pub struct RouterState {
    /// Atomically-swappable live config; the lock is held only for the
    /// duration of `Arc::clone`, so it never blocks request handling.
    config_lock: Arc<RwLock<Arc<Config>>>,
    /// Path to the config file on disk — used by the hot-reload background task.
    pub config_path: PathBuf,
    /// In-memory ring-buffer of recent requests, exposed through the admin API.
    pub traffic: Arc<TrafficLog>,
    /// Broker start time — used to compute uptime for the public status endpoint.
    pub started_at: std::time::Instant,
    /// Optional per-IP rate limiter. `None` means rate limiting is disabled.
    ///
    /// Built once at startup from `config.gateway.rate_limit_rpm`. A config
    /// hot-reload will NOT update the rate limiter; restart required to
    /// change the RPM limit at runtime.
    pub rate_limiter: Option<Arc<RateLimiter>>,
    /// Bearer token required for admin API access.
    ///
    /// `None` means admin auth is disabled (port should then be firewalled).
    /// Resolved at startup from `config.gateway.admin_token_env`; not
    /// updated on hot-reload.
    pub admin_token: Option<String>,
    /// API key value → resolved account id, shared by the client-facing auth
    /// middleware and the provider session authenticator.
    ///
    /// Built at startup by reading each `[[accounts]]` entry's `key_env`.
    /// Not updated on hot-reload; restart required to pick up new accounts.
    pub api_keys: HashMap<String, AccountId>,
    /// The live provider catalog (§3, §5).
    pub registry: Arc<ProviderRegistry>,
    /// Ties registry, ledger, and tokenomics into the request path (§4).
    pub dispatcher: Arc<Dispatcher>,
}

impl RouterState {
    pub fn new(config: Arc<Config>, config_path: PathBuf, traffic: Arc<TrafficLog>) -> anyhow::Result<Self> {
        let rate_limiter = config
            .gateway
            .rate_limit_rpm
            .filter(|&rpm| rpm > 0)
            .map(|rpm| Arc::new(RateLimiter::new(rpm)));
        let admin_token = config
            .gateway
            .admin_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());
        let api_keys = config.resolve_api_keys()?;
        if !api_keys.is_empty() {
            tracing::info!(count = api_keys.len(), "loaded account credentials");
        }

        let registry = Arc::new(ProviderRegistry::new());
        let ledger: Arc<dyn LedgerStore> = InMemoryStore::new();
        let reconciliation = Arc::new(ReconciliationLog::new());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            ledger,
            reconciliation,
            config.tokenomics(),
            config.dispatcher(),
        ));

        Ok(Self {
            config_lock: Arc::new(RwLock::new(config)),
            config_path,
            traffic,
            started_at: std::time::Instant::now(),
            rate_limiter,
            admin_token,
            api_keys,
            registry,
            dispatcher,
        })
    }

    /// Returns a snapshot of the current live config.
    ///
    /// The `RwLock` is held only for the duration of `Arc::clone`
    /// (nanoseconds), so callers get a stable reference with no contention risk.
    pub fn config(&self) -> Arc<Config> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    /// Atomically replaces the live config. Called only from the hot-reload task.
    ///
    /// The registry, dispatcher, and ledger are NOT rebuilt on reload — only
    /// the tunables read directly off `config()` (e.g. `admin_token_env`'s
    /// resolved value was already snapshotted at startup) change on the next
    /// lookup. A config change to `load_threshold` or the heartbeat tunables
    /// requires a restart, matching the rate limiter's own restart-required note.
    pub fn replace_config(&self, new: Arc<Config>) {
        *self.config_lock.write().expect("config lock poisoned") = new;
    }

    /// Builds the session state handed to `session::provider_ws`.
    pub fn session_state(&self) -> Arc<SessionState> {
        let config = self.config();
        Arc::new(SessionState {
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            authenticator: Arc::new(StaticKeyAuthenticator { keys: self.api_keys.clone() }),
            allow_anonymous_providers: config.gateway.allow_anonymous_providers,
            heartbeat: config.heartbeat(),
        })
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        self.config().heartbeat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config() -> Arc<Config> {
        Arc::new(toml::from_str("[gateway]\n").unwrap())
    }

    #[test]
    fn new_builds_empty_registry_and_no_rate_limiter() {
        let state = RouterState::new(config(), PathBuf::from("config.toml"), Arc::new(TrafficLog::new(10))).unwrap();
        assert_eq!(state.registry.len(), 0);
        assert!(state.rate_limiter.is_none());
        assert!(state.api_keys.is_empty());
    }

    #[test]
    fn replace_config_is_visible_to_subsequent_reads() {
        let state = RouterState::new(config(), PathBuf::from("config.toml"), Arc::new(TrafficLog::new(10))).unwrap();
        let mut replacement: Config = toml::from_str("[gateway]\nclient_port = 9090\n").unwrap();
        replacement.gateway.admin_port = 9091;
        state.replace_config(Arc::new(replacement));
        assert_eq!(state.config().gateway.client_port, 9090);
    }

    #[test]
    fn session_state_reflects_current_heartbeat_config() {
        let state = RouterState::new(config(), PathBuf::from("config.toml"), Arc::new(TrafficLog::new(10))).unwrap();
        let session_state = state.session_state();
        assert_eq!(session_state.heartbeat.ping_interval, std::time::Duration::from_secs(15));
    }
}
