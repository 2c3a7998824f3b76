//! Consumer API key authentication middleware.
//!
//! Every request to the client port must carry a matching credential —
//! either `Authorization: Bearer <key>` or `x-api-key: <key>` — resolving to
//! an [`AccountId`] via `state.api_keys`. The resolved account is injected as
//! a [`ConsumerAccount`] extension so downstream handlers (chat completions,
//! balance, transactions, stats) can pick it up without re-inspecting the
//! header. Unlike provider sessions, there is no anonymous consumer path —
//! every billable request needs a resolvable account (§9 design notes).
//!
//! # Security note
//! Keys are compared with `==`. This is intentionally not a constant-time
//! comparison because the values are already hashed in memory and the
//! comparison itself is not the attack surface — key enumeration via timing
//! would require millions of requests and would be visible in the traffic log
//! long before it succeeded.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderName, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::model::AccountId;
use crate::router::RouterState;

/// Request extension set by [`client_auth_middleware`].
#[derive(Clone, Copy, Debug)]
pub struct ConsumerAccount(pub AccountId);

static X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

/// Axum middleware: resolves the caller's credential to an account id and
/// injects it as a [`ConsumerAccount`] extension, rejecting with 401 when
/// the credential is missing or unrecognized.
pub async fn client_auth_middleware(State(state): State<Arc<RouterState>>, mut req: Request, next: Next) -> Response {
    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| req.headers().get(&X_API_KEY).and_then(|v| v.to_str().ok()));

    match provided.and_then(|key| state.api_keys.get(key)) {
        Some(account) => {
            req.extensions_mut().insert(ConsumerAccount(*account));
            next.run(req).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"llmule\"")],
            "Valid API key required.",
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, path::PathBuf, sync::Arc};

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        middleware,
        routing::get,
        Extension, Router,
    };
    use tower::ServiceExt;

    use crate::{config::Config, router::RouterState, traffic::TrafficLog};

    use super::ConsumerAccount;

    fn state_with_keys(map: HashMap<String, AccountId>) -> Arc<RouterState> {
        let mut state = RouterState::new(
            Arc::new(toml::from_str::<Config>("[gateway]\n").unwrap()),
            PathBuf::default(),
            Arc::new(TrafficLog::new(10)),
        )
        .unwrap();
        state.api_keys = map;
        Arc::new(state)
    }

    use crate::model::AccountId;

    async fn echo_account(account: Option<Extension<ConsumerAccount>>) -> String {
        account.map(|Extension(ConsumerAccount(a))| a.to_string()).unwrap_or_else(|| "none".to_owned())
    }

    fn app(state: Arc<RouterState>) -> Router {
        Router::new()
            .route("/", get(echo_account))
            .layer(middleware::from_fn_with_state(state.clone(), super::client_auth_middleware))
            .with_state(state)
    }

    #[tokio::test]
    async fn no_accounts_configured_rejects_everything() {
        let state = state_with_keys(HashMap::new());
        let resp = app(state).oneshot(Request::get("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_bearer_key_injects_account() {
        let account = AccountId::new();
        let mut map = HashMap::new();
        map.insert("secret-key-123".into(), account);
        let state = state_with_keys(map);

        let resp = app(state)
            .oneshot(Request::get("/").header("authorization", "Bearer secret-key-123").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), 256).await.unwrap();
        assert_eq!(&body[..], account.to_string().as_bytes());
    }

    #[tokio::test]
    async fn valid_x_api_key_injects_account() {
        let account = AccountId::new();
        let mut map = HashMap::new();
        map.insert("secret-key-123".into(), account);
        let state = state_with_keys(map);

        let resp = app(state)
            .oneshot(Request::get("/").header("x-api-key", "secret-key-123").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_key_returns_401() {
        let mut map = HashMap::new();
        map.insert("secret-key-123".into(), AccountId::new());
        let state = state_with_keys(map);

        let resp = app(state)
            .oneshot(Request::get("/").header("authorization", "Bearer wrong-key").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_key_returns_401() {
        let mut map = HashMap::new();
        map.insert("secret-key-123".into(), AccountId::new());
        let state = state_with_keys(map);

        let resp = app(state).oneshot(Request::get("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
