//! Wire types for both the client-facing RPC and the provider-facing duplex
//! protocol (§6). Provider messages are framed as JSON text frames over the
//! WebSocket; the `op` tag discriminates the message kind exactly as §6
//! lays out.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One chat message in an OpenAI-compatible conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// `POST /v1/chat/completions` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Per-request override of `T_req`, clamped to the hard cap (§6 tunables).
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Streaming is not implemented by this core; accepted and ignored if
    /// `false`, rejected by the handler if `true`.
    #[serde(default)]
    pub stream: bool,
}

/// Raw token usage as reported by a provider, before the broker recomputes
/// `total` from `prompt + completion` (§8 scenario 5).
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct RawUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// One OpenAI-shaped choice as returned by the provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// The provider's raw chat-completion payload, as carried inside
/// `completion_response`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawChatCompletion {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: RawUsage,
}

/// Accounting enrichment appended to every successful client response (§6).
#[derive(Debug, Clone, Serialize)]
pub struct UsageInfo {
    pub mule_amount: rust_decimal::Decimal,
    pub duration_seconds: f64,
    pub tokens_per_second: f64,
    pub transaction_mule_cost: rust_decimal::Decimal,
}

/// `POST /v1/chat/completions` response body — the provider's chat
/// completion, enriched with broker-side accounting fields.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub model_tier: crate::classifier::Tier,
    pub provider_id: String,
    pub usage: UsageInfo,
}

/// Inbound messages from a provider over the duplex session (§4.6, §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InboundMessage {
    Register {
        api_key: String,
        models: Vec<String>,
    },
    Pong,
    CompletionResponse {
        id: Uuid,
        response: RawChatCompletion,
    },
}

/// Outbound messages to a provider over the duplex session (§4.6, §6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProviderMessage {
    Ping,
    Registered,
    Error {
        error: String,
    },
    CompletionRequest {
        id: Uuid,
        model: String,
        messages: Vec<ChatMessage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        temperature: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_message_parses_from_wire_shape() {
        let raw = r#"{"op":"register","api_key":"sk-test","models":["mistral:7b"]}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        match msg {
            InboundMessage::Register { api_key, models } => {
                assert_eq!(api_key, "sk-test");
                assert_eq!(models, vec!["mistral:7b".to_string()]);
            }
            _ => panic!("expected Register"),
        }
    }

    #[test]
    fn completion_response_round_trips_correlation_id() {
        let id = Uuid::new_v4();
        let raw = serde_json::json!({
            "op": "completion_response",
            "id": id,
            "response": {
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}}],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
            }
        });
        let msg: InboundMessage = serde_json::from_value(raw).unwrap();
        match msg {
            InboundMessage::CompletionResponse { id: got, response } => {
                assert_eq!(got, id);
                assert_eq!(response.choices.len(), 1);
            }
            _ => panic!("expected CompletionResponse"),
        }
    }

    #[test]
    fn outbound_completion_request_serializes_with_op_tag() {
        let msg = ProviderMessage::CompletionRequest {
            id: Uuid::new_v4(),
            model: "mistral:7b".into(),
            messages: vec![ChatMessage { role: "user".into(), content: "hi".into() }],
            temperature: None,
            max_tokens: Some(100),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["op"], "completion_request");
        assert_eq!(json["max_tokens"], 100);
        assert!(json.get("temperature").is_none());
    }
}
