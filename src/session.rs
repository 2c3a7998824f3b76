//! Session Layer.
//!
//! One Axum WebSocket handler per provider connection: registration
//! handshake, a writer task owning the socket's sink exclusively, and a
//! reader loop that demuxes `completion_response`/`pong` messages and drives
//! the per-connection heartbeat protocol (§4.4, §4.6) via a single
//! `tokio::select!`, mirroring the teacher's dual-listener `select!` in
//! `main.rs` rather than a separate poller task.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::dispatcher::Dispatcher;
use crate::model::{CorrelationId, SessionId};
use crate::protocol::{InboundMessage, ProviderMessage};
use crate::registry::{ProviderRegistry, RegisterOutcome};

/// Tunables governing the heartbeat protocol (§4.4, §6).
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(45),
        }
    }
}

/// Resolves a provider's presented API key to an account id. `None` means
/// anonymous — permitted only when `allow_anonymous_providers` is set;
/// suppresses ledger credit for that provider entirely (§9 design notes).
pub trait ProviderAuthenticator: Send + Sync {
    fn resolve(&self, api_key: &str) -> Result<Option<crate::model::AccountId>, ()>;
}

pub struct SessionState {
    pub registry: Arc<ProviderRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub authenticator: Arc<dyn ProviderAuthenticator>,
    pub allow_anonymous_providers: bool,
    pub heartbeat: HeartbeatConfig,
}

pub async fn provider_ws(ws: WebSocketUpgrade, State(state): State<Arc<SessionState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<SessionState>) {
    let (mut sink, mut stream) = socket.split();
    let session_id = SessionId::new();

    let hello = match wait_for_register(&mut stream).await {
        Some(msg) => msg,
        None => {
            let _ = sink
                .send(Message::Text(
                    serde_json::to_string(&ProviderMessage::Error { error: "registration timed out or malformed".into() }).unwrap(),
                ))
                .await;
            return;
        }
    };

    let InboundMessage::Register { api_key, models } = hello else {
        let _ = sink
            .send(Message::Text(
                serde_json::to_string(&ProviderMessage::Error { error: "first message must be register".into() }).unwrap(),
            ))
            .await;
        return;
    };

    let account_id = match state.authenticator.resolve(&api_key) {
        Ok(Some(account)) => Some(account),
        Ok(None) if state.allow_anonymous_providers => None,
        Ok(None) | Err(()) => {
            let _ = sink
                .send(Message::Text(
                    serde_json::to_string(&ProviderMessage::Error { error: "invalid credential".into() }).unwrap(),
                ))
                .await;
            return;
        }
    };

    let (write_tx, mut write_rx) = mpsc::channel::<ProviderMessage>(64);
    let outcome = state.registry.register(session_id, account_id, models, write_tx.clone());
    tracing::info!(%session_id, ?account_id, registered = ?outcome, "provider session registered");

    let ack = serde_json::to_string(&ProviderMessage::Registered).unwrap();
    if sink.send(Message::Text(ack)).await.is_err() {
        state.registry.remove(session_id);
        return;
    }

    // Writer task owns the sink exclusively — the entry's write handle is
    // the sender half; once the entry is removed the only remaining sender
    // clone here is dropped and the channel closes, so a send against a
    // removed entry fails harmlessly rather than racing the socket.
    let writer = tokio::spawn(async move {
        while let Some(message) = write_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut ping_interval = tokio::time::interval(state.heartbeat.ping_interval);
    ping_interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<InboundMessage>(&text) {
                            Ok(msg) => handle_inbound(&state, session_id, msg, &write_tx).await,
                            Err(e) => tracing::debug!(%session_id, error = %e, "dropping malformed frame"),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => state.registry.heartbeat(session_id),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(%session_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
            _ = ping_interval.tick() => {
                // Every session the sweep removes loses its registry entry right
                // here, not just this connection's own — fail its pending
                // requests now so none of them ride out the full request
                // timeout waiting on a provider that's already gone (§4.4, §8
                // Liveness: failed within one heartbeat tick).
                let removed = state.registry.sweep_heartbeats(state.heartbeat.timeout);
                for id in &removed {
                    state.dispatcher.fail_pending_for_session(*id);
                }
                if removed.contains(&session_id) {
                    break;
                }
                if write_tx.send(ProviderMessage::Ping).await.is_err() {
                    break;
                }
            }
        }
    }

    writer.abort();
    state.dispatcher.fail_pending_for_session(session_id);
    state.registry.remove(session_id);
    tracing::info!(%session_id, "provider session closed");
}

async fn wait_for_register(stream: &mut futures_util::stream::SplitStream<WebSocket>) -> Option<InboundMessage> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return serde_json::from_str::<InboundMessage>(&text).ok();
            }
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

async fn handle_inbound(
    state: &SessionState,
    session_id: SessionId,
    msg: InboundMessage,
    write_tx: &mpsc::Sender<ProviderMessage>,
) {
    match msg {
        InboundMessage::Register { .. } => {
            // Already active: no state change, but still ack so a provider
            // that resent `register` after a reconnect race sees the same
            // handshake response it would on a fresh connection (§4.6).
            state.registry.heartbeat(session_id);
            let _ = write_tx.send(ProviderMessage::Registered).await;
        }
        InboundMessage::Pong => state.registry.heartbeat(session_id),
        InboundMessage::CompletionResponse { id, response } => {
            state.registry.heartbeat(session_id);
            state.dispatcher.complete_request(CorrelationId(id), response);
        }
    }
}

/// Concrete [`ProviderAuthenticator`] backed by the static `api_keys` map
/// from configuration — the same credential surface the client-facing
/// middleware resolves consumer identity against (§6: unified account
/// resolution).
pub struct StaticKeyAuthenticator {
    pub keys: std::collections::HashMap<String, crate::model::AccountId>,
}

impl ProviderAuthenticator for StaticKeyAuthenticator {
    fn resolve(&self, api_key: &str) -> Result<Option<crate::model::AccountId>, ()> {
        Ok(self.keys.get(api_key).copied())
    }
}
