//! Ledger Gateway.
//!
//! Exposes the balance and transaction-log operations over a pluggable
//! `LedgerStore` trait — the durable database itself is explicitly out of
//! scope (§1), so this crate defines the boundary precisely and ships one
//! concrete implementation, [`InMemoryStore`], good enough for tests and a
//! single-node deployment. A real deployment swaps in a different
//! `LedgerStore` without touching the dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::classifier::Tier;
use crate::model::{AccountId, Balance, Performance, Transaction, TransactionKind};
use crate::tokenomics::{self, Tokenomics};

/// Reported usage for one completed request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A settlement that could not be applied atomically by the backing store.
/// Surfaced through `GET /admin/reconciliation` rather than swallowed.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReconciliationEntry {
    pub recorded_at: chrono::DateTime<Utc>,
    pub consumer: AccountId,
    pub provider: Option<AccountId>,
    pub amount: Decimal,
    pub reason: String,
}

/// Accumulates settlement failures for operator visibility. Not itself part
/// of `LedgerStore` — a store either succeeds, or pushes here and still
/// returns success to the caller (§4.3 failure semantics: never fail the
/// client request for a post-response accounting hiccup).
#[derive(Default)]
pub struct ReconciliationLog {
    entries: Mutex<Vec<ReconciliationEntry>>,
}

impl ReconciliationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, entry: ReconciliationEntry) {
        tracing::warn!(
            consumer = %entry.consumer,
            provider = ?entry.provider,
            amount = %entry.amount,
            reason = %entry.reason,
            "settlement requires reconciliation"
        );
        self.entries.lock().await.push(entry);
    }

    pub async fn snapshot(&self) -> Vec<ReconciliationEntry> {
        self.entries.lock().await.clone()
    }
}

/// The four atomic primitives plus the default `settle` operation (§4.3).
///
/// `settle`'s default implementation is expressed purely in terms of the
/// primitives below, so every store implementation inherits correct
/// settlement semantics (self-service skip, anonymous-provider skip, fee
/// split) without re-deriving them.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Idempotently create a balance row seeded with `welcome_amount` on
    /// first sight. Concurrent callers must converge to exactly one
    /// creation and exactly one `deposit` transaction.
    async fn ensure_balance(&self, account: AccountId, cfg: &Tokenomics) -> anyhow::Result<()>;

    async fn get_balance(&self, account: AccountId, cfg: &Tokenomics) -> anyhow::Result<Decimal>;

    async fn credit(&self, account: AccountId, amount: Decimal) -> anyhow::Result<()>;

    async fn debit(&self, account: AccountId, amount: Decimal) -> anyhow::Result<()>;

    async fn record_transaction(&self, tx: Transaction) -> anyhow::Result<()>;

    /// Recent transactions for an account, newest first, as both consumer
    /// and provider.
    async fn transactions_for(&self, account: AccountId, limit: usize) -> anyhow::Result<Vec<Transaction>>;

    /// Settle a completed request (§4.3). Default implementation:
    /// 1. `m = tokens_to_mules(usage.total, tier)`, `fee = platform_fee(m)`.
    /// 2. Self-service (`consumer == provider`) → record only, no balance move.
    /// 3. Anonymous provider (`provider.is_none()`) → debit consumer only,
    ///    no credit anywhere (design notes: anonymous providers never
    ///    receive ledger credit).
    /// 4. Otherwise debit consumer, credit provider `m - fee`, record.
    /// 5. Degenerate usage (`m == 0`) → record only, skip balance movement.
    async fn settle(
        &self,
        consumer: AccountId,
        provider: Option<AccountId>,
        model: &str,
        tier: Tier,
        usage: Usage,
        performance: Option<Performance>,
        cfg: &Tokenomics,
    ) -> anyhow::Result<Transaction> {
        let m = tokenomics::tokens_to_mules(usage.total_tokens as i64, tier, cfg);
        let fee = tokenomics::platform_fee(m, cfg);
        let is_self_service = provider == Some(consumer);

        let kind = if is_self_service {
            TransactionKind::SelfService
        } else {
            TransactionKind::Consumption
        };

        if m > Decimal::ZERO && !is_self_service {
            if let Some(provider) = provider {
                self.debit(consumer, m).await?;
                self.credit(provider, tokenomics::provider_earnings(m, cfg)).await?;
            } else {
                // Anonymous provider: consumer still pays, nobody is credited.
                self.debit(consumer, m).await?;
            }
        }

        let tx = Transaction {
            timestamp: Utc::now(),
            kind,
            consumer,
            provider: if is_self_service { None } else { provider },
            model: model.to_string(),
            tier,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            mule_amount: m,
            platform_fee: if is_self_service { Decimal::ZERO } else { fee },
            performance,
            metadata: serde_json::Value::Null,
        };

        self.record_transaction(tx.clone()).await?;
        Ok(tx)
    }
}

/// In-process `LedgerStore`. Balances live in a `DashMap` (no single global
/// lock on the hot path); the transaction log is an append-only
/// `Mutex<Vec<_>>` — correct for a single process, not for multi-node
/// deployment (a real deployment backs `LedgerStore` with the durable store
/// named in §6 instead).
pub struct InMemoryStore {
    balances: DashMap<AccountId, Balance>,
    transactions: Mutex<Vec<Transaction>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            balances: DashMap::new(),
            transactions: Mutex::new(Vec::new()),
        })
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            balances: DashMap::new(),
            transactions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn ensure_balance(&self, account: AccountId, cfg: &Tokenomics) -> anyhow::Result<()> {
        if self.balances.contains_key(&account) {
            return Ok(());
        }
        // `entry` is the upsert-if-absent primitive DashMap gives us; two
        // concurrent callers race here but only one wins the insert.
        let mut created = false;
        self.balances.entry(account).or_insert_with(|| {
            created = true;
            Balance {
                account_id: account,
                mules: cfg.welcome_amount,
                last_updated: Utc::now(),
            }
        });

        if created {
            self.record_transaction(Transaction {
                timestamp: Utc::now(),
                kind: TransactionKind::Deposit,
                consumer: account,
                provider: None,
                model: String::new(),
                tier: Tier::Medium,
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
                mule_amount: cfg.welcome_amount,
                platform_fee: Decimal::ZERO,
                performance: None,
                metadata: serde_json::json!({ "reason": "welcome_bonus" }),
            })
            .await?;
        }
        Ok(())
    }

    async fn get_balance(&self, account: AccountId, cfg: &Tokenomics) -> anyhow::Result<Decimal> {
        self.ensure_balance(account, cfg).await?;
        Ok(self
            .balances
            .get(&account)
            .map(|b| b.mules)
            .unwrap_or(Decimal::ZERO))
    }

    async fn credit(&self, account: AccountId, amount: Decimal) -> anyhow::Result<()> {
        let mut entry = self.balances.entry(account).or_insert_with(|| Balance {
            account_id: account,
            mules: Decimal::ZERO,
            last_updated: Utc::now(),
        });
        entry.mules += amount;
        entry.last_updated = Utc::now();
        Ok(())
    }

    async fn debit(&self, account: AccountId, amount: Decimal) -> anyhow::Result<()> {
        let mut entry = self.balances.entry(account).or_insert_with(|| Balance {
            account_id: account,
            mules: Decimal::ZERO,
            last_updated: Utc::now(),
        });
        entry.mules -= amount;
        entry.last_updated = Utc::now();
        Ok(())
    }

    async fn record_transaction(&self, tx: Transaction) -> anyhow::Result<()> {
        self.transactions.lock().await.push(tx);
        Ok(())
    }

    async fn transactions_for(&self, account: AccountId, limit: usize) -> anyhow::Result<Vec<Transaction>> {
        let txs = self.transactions.lock().await;
        Ok(txs
            .iter()
            .rev()
            .filter(|t| t.consumer == account || t.provider == Some(account))
            .take(limit)
            .cloned()
            .collect())
    }
}
