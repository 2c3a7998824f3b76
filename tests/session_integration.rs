//! End-to-end test driving the full stack through real transports: a
//! `tokio-tungstenite` client plays the provider side of the duplex
//! protocol (§4.6) and `reqwest` plays an API client hitting
//! `/v1/chat/completions` (§6), against an in-process Axum server bound to
//! an ephemeral port. This is the one place the registry, dispatcher,
//! ledger, and session layer are exercised together rather than in
//! isolation.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use llmule_broker::{config::AccountCredential, router::RouterState, Config, TrafficLog};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

/// Spins up the client-port router on an ephemeral port with two accounts
/// (`provider` and `consumer`) and returns the bound address plus the API
/// keys resolved for each. The server task is detached; it lives for the
/// duration of the test process.
async fn spawn_server() -> (SocketAddr, String, String) {
    let provider_key = format!("provider-key-{}", Uuid::new_v4());
    let consumer_key = format!("consumer-key-{}", Uuid::new_v4());
    let provider_key_env = format!("TEST_PROVIDER_KEY_{}", Uuid::new_v4().simple());
    let consumer_key_env = format!("TEST_CONSUMER_KEY_{}", Uuid::new_v4().simple());

    std::env::set_var(&provider_key_env, &provider_key);
    std::env::set_var(&consumer_key_env, &consumer_key);

    let mut config = Config {
        gateway: toml::from_str("client_port = 0\nadmin_port = 1\n").unwrap(),
        tokenomics: Default::default(),
        accounts: vec![],
    };
    config.accounts.push(AccountCredential { key_env: provider_key_env, account_id: Uuid::new_v4() });
    config.accounts.push(AccountCredential { key_env: consumer_key_env, account_id: Uuid::new_v4() });

    let state = std::sync::Arc::new(
        RouterState::new(std::sync::Arc::new(config), std::path::PathBuf::default(), std::sync::Arc::new(TrafficLog::new(100)))
            .expect("router state builds"),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = llmule_broker::api::client::router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, provider_key, consumer_key)
}

#[tokio::test]
async fn provider_registers_and_serves_a_chat_completion() {
    let (addr, provider_key, consumer_key) = spawn_server().await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/v1/providers/ws")).await.unwrap();

    ws.send(WsMessage::Text(
        json!({"op": "register", "api_key": provider_key, "models": ["mistral:7b"]}).to_string(),
    ))
    .await
    .unwrap();

    let ack = ws.next().await.unwrap().unwrap();
    let ack: Value = serde_json::from_str(ack.to_text().unwrap()).unwrap();
    assert_eq!(ack["op"], "registered");

    // Provider side: answer the next completion_request with a canned response.
    let provider_task = tokio::spawn(async move {
        let frame = ws.next().await.unwrap().unwrap();
        let request: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(request["op"], "completion_request");
        let id = request["id"].clone();

        ws.send(WsMessage::Text(
            json!({
                "op": "completion_response",
                "id": id,
                "response": {
                    "id": "chatcmpl-test",
                    "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello there"}, "finish_reason": "stop"}],
                    "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 0}
                }
            })
            .to_string(),
        ))
        .await
        .unwrap();
        ws
    });

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/v1/chat/completions"))
        .bearer_auth(&consumer_key)
        .json(&json!({
            "model": "mistral:7b",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 100,
            "stream": false
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();

    assert_eq!(body["choices"][0]["message"]["content"], "hello there");
    assert_eq!(body["model_tier"], "medium");
    // §8 scenario 5: the dispatcher recomputes total from prompt+completion,
    // ignoring the provider's degenerate total_tokens:0.
    let expected_mule: f64 = 30.0 / 500_000.0;
    let mule_amount = body["usage"]["mule_amount"].as_str().unwrap_or_default().parse::<f64>().unwrap_or_else(|_| {
        body["usage"]["mule_amount"].as_f64().unwrap()
    });
    assert!((mule_amount - expected_mule).abs() < 1e-9, "unexpected mule_amount: {}", body["usage"]["mule_amount"]);

    let balance_resp = client.get(format!("http://{addr}/v1/balance")).bearer_auth(&consumer_key).send().await.unwrap();
    assert_eq!(balance_resp.status(), 200);
    let balance: Value = balance_resp.json().await.unwrap();
    let mules = balance["mules"].as_str().unwrap_or_default().parse::<f64>().unwrap_or_else(|_| balance["mules"].as_f64().unwrap());
    // welcome_amount (1.0) minus the settled consumption.
    assert!((mules - (1.0 - expected_mule)).abs() < 1e-9, "unexpected balance: {}", balance["mules"]);

    provider_task.await.unwrap();
}

#[tokio::test]
async fn request_for_unavailable_model_is_rejected_with_400() {
    let (addr, _provider_key, consumer_key) = spawn_server().await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/v1/chat/completions"))
        .bearer_auth(&consumer_key)
        .json(&json!({
            "model": "mistral:7b",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": false
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "model_not_available");
}

#[tokio::test]
async fn unauthenticated_request_is_rejected_with_401() {
    let (addr, _provider_key, _consumer_key) = spawn_server().await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&json!({"model": "small", "messages": [], "stream": false}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
}
