//! Unified error taxonomy for the broker core (§7).
//!
//! [`BrokerError`] is the stable, surfaced error taxonomy — one variant per
//! §7 code. [`AppError`] wraps it (or any other `anyhow`-convertible
//! failure, bucketed as `INTERNAL`) and implements [`IntoResponse`] so every
//! handler can return `Result<T, AppError>` and propagate with `?`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

/// Stable surface error codes (§7). Each carries exactly the context its
/// message needs.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("model identifier could not be classified")]
    InvalidModel,

    #[error("no eligible provider available for this request")]
    NoProviderAvailable,

    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("provider did not respond within the request timeout")]
    ProviderTimeout,

    #[error("provider connection failed or dropped mid-request")]
    ProviderTransportError,

    #[error("provider response was missing choices or content")]
    ProviderBadResponse,

    #[error("internal error")]
    Internal,
}

impl BrokerError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidModel => StatusCode::BAD_REQUEST,
            Self::NoProviderAvailable => StatusCode::BAD_REQUEST,
            Self::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::ProviderTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::ProviderTransportError => StatusCode::BAD_GATEWAY,
            Self::ProviderBadResponse => StatusCode::BAD_GATEWAY,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidModel => "invalid_model",
            Self::NoProviderAvailable => "model_not_available",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::ProviderTimeout => "provider_timeout",
            Self::ProviderTransportError => "provider_transport_error",
            Self::ProviderBadResponse => "provider_bad_response",
            Self::Internal => "internal",
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::InsufficientBalance { .. } => "insufficient_quota",
            Self::InvalidModel | Self::NoProviderAvailable => "invalid_request_error",
            _ => "api_error",
        }
    }
}

/// Wraps [`BrokerError`] for axum handlers. Any other `Into<anyhow::Error>`
/// failure (config, ledger I/O, serialization) is bucketed as `INTERNAL` and
/// never leaks details beyond a generic message, per §7.
#[derive(Debug)]
pub struct AppError {
    broker: BrokerError,
    /// The underlying cause, logged but never rendered to the client for
    /// `INTERNAL` errors.
    source: Option<anyhow::Error>,
}

impl AppError {
    pub fn new(broker: BrokerError) -> Self {
        Self { broker, source: None }
    }
}

impl From<BrokerError> for AppError {
    fn from(broker: BrokerError) -> Self {
        Self::new(broker)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        Self {
            broker: BrokerError::Internal,
            source: Some(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(source) = &self.source {
            tracing::warn!(error = %source, code = self.broker.code(), "handler error");
        } else {
            tracing::warn!(code = self.broker.code(), "handler error");
        }

        let body = Json(json!({
            "error": {
                "message": self.broker.to_string(),
                "type": self.broker.error_type(),
                "code": self.broker.code(),
            }
        }));
        (self.broker.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_balance_maps_to_402() {
        let err = AppError::from(BrokerError::InsufficientBalance {
            required: Decimal::ONE,
            available: Decimal::ZERO,
        });
        assert_eq!(err.broker.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn invalid_model_maps_to_400() {
        let err = AppError::from(BrokerError::InvalidModel);
        assert_eq!(err.broker.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn provider_timeout_maps_to_504() {
        let err = AppError::from(BrokerError::ProviderTimeout);
        assert_eq!(err.broker.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn anonymous_anyhow_error_is_internal_and_generic() {
        let err: AppError = anyhow::anyhow!("db connection string leaked details").into();
        assert_eq!(err.broker.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.broker.to_string(), "internal error");
    }
}
