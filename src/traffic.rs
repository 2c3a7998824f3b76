//! In-memory traffic log exposed through the admin API.
//!
//! [`TrafficLog`] is a fixed-capacity ring-buffer: once full, the oldest entry
//! is evicted to make room for the newest. This gives a bounded, O(1) memory
//! footprint regardless of request volume.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Fixed-capacity ring-buffer of recent [`TrafficEntry`] records.
///
/// Safe to share across threads via `Arc<TrafficLog>`. [`push`][Self::push] uses
/// a non-blocking `try_lock` so it never delays request handling; in the
/// unlikely event of lock contention the entry is silently dropped.
pub struct TrafficLog {
    capacity: usize,
    entries: Mutex<VecDeque<TrafficEntry>>,
}

impl TrafficLog {
    /// Create a new log with the given capacity.
    ///
    /// `capacity` is the maximum number of entries retained. Older entries are
    /// silently dropped once the buffer is full.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a completed request.
    ///
    /// This is a best-effort, non-blocking operation: if the mutex is
    /// contended the entry is dropped rather than blocking the request path.
    pub fn push(&self, entry: TrafficEntry) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Return up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Compute aggregate statistics over all buffered entries.
    pub async fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };

        let error_count = entries.iter().filter(|e| !e.success).count();
        let total_mule_volume = entries.iter().filter_map(|e| e.mule_amount).sum();

        let mut tier_counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for entry in entries.iter().filter_map(|e| e.tier.as_deref()) {
            *tier_counts.entry(entry.to_string()).or_default() += 1;
        }

        TrafficStats {
            total_requests: total,
            error_count,
            avg_latency_ms,
            total_mule_volume,
            tier_counts,
        }
    }
}

/// A single `/v1/chat/completions` request record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEntry {
    /// Unique request id.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// The consumer account's public handle.
    pub consumer: Option<String>,
    /// Original `model` string from the request body.
    pub requested_model: Option<String>,
    /// Resolved tier, when classification succeeded.
    pub tier: Option<String>,
    /// The serving provider's public handle, when one was selected.
    pub provider: Option<String>,
    /// MULE amount settled for this request.
    pub mule_amount: Option<Decimal>,
    /// End-to-end latency in milliseconds.
    pub latency_ms: u64,
    pub success: bool,
    /// Error code when `success` is `false` (§7 `BrokerError` code).
    pub error: Option<String>,
}

impl TrafficEntry {
    pub fn new(latency_ms: u64, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            consumer: None,
            requested_model: None,
            tier: None,
            provider: None,
            mule_amount: None,
            latency_ms,
            success,
            error: None,
        }
    }

    pub fn with_consumer(mut self, handle: &str) -> Self {
        self.consumer = Some(handle.to_string());
        self
    }

    pub fn with_requested_model(mut self, model: &str) -> Self {
        self.requested_model = Some(model.to_string());
        self
    }

    pub fn with_tier(mut self, tier: &str) -> Self {
        self.tier = Some(tier.to_string());
        self
    }

    pub fn with_provider(mut self, handle: &str) -> Self {
        self.provider = Some(handle.to_string());
        self
    }

    pub fn with_mule_amount(mut self, amount: Decimal) -> Self {
        self.mule_amount = Some(amount);
        self
    }

    pub fn with_error(mut self, err: &str) -> Self {
        self.error = Some(err.to_string());
        self
    }
}

/// Aggregate statistics derived from all buffered [`TrafficEntry`] records.
#[derive(Debug, Serialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    pub error_count: usize,
    pub avg_latency_ms: f64,
    pub total_mule_volume: Decimal,
    pub tier_counts: std::collections::HashMap<String, usize>,
}
