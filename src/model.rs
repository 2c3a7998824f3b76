//! Shared domain types used across the broker core.
//!
//! These are the concrete Rust shapes behind the data model: accounts,
//! sessions, correlation ids, balances, and the append-only transaction log.
//! Money is always `rust_decimal::Decimal` — never `f64`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classifier::Tier;

/// Identifies a broker account (consumer or provider side of the ledger).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub Uuid);

impl AccountId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic public handle shown to clients, e.g. in `/v1/models`.
    ///
    /// Derived from the first 4 bytes of the account id's byte form, reduced
    /// modulo 1 000 000. Total and collision-resistant for the expected
    /// provider population.
    pub fn handle(&self) -> String {
        let bytes = self.0.as_bytes();
        let n = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) % 1_000_000;
        format!("user_{n}")
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one live provider connection. Assigned on connect, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-request identifier used to match a `completion_response` back to the
/// waiter that sent the matching `completion_request`. Unique per broker
/// lifetime (a fresh `Uuid::new_v4` per dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted MULE balance. One row per account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: AccountId,
    pub mules: Decimal,
    pub last_updated: DateTime<Utc>,
}

/// Kind of ledger transaction. Mirrors the four kinds in the data model verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Consumption,
    SelfService,
    Deposit,
    Withdrawal,
}

/// Performance sample recorded after a completed or failed dispatch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Performance {
    pub duration_seconds: f64,
    pub tokens_per_second: f64,
    pub success: bool,
}

/// An append-only ledger entry. Never updated or deleted once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub timestamp: DateTime<Utc>,
    pub kind: TransactionKind,
    pub consumer: AccountId,
    /// Absent for `self_service` (consumer == provider) and `deposit`/`withdrawal`.
    /// Also absent when the serving provider has no resolved account
    /// (the anonymous-provider escape hatch — see `[[registry]]` design notes).
    pub provider: Option<AccountId>,
    pub model: String,
    pub tier: Tier,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub mule_amount: Decimal,
    pub platform_fee: Decimal,
    pub performance: Option<Performance>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}
