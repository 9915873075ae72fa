//! nexus_cost
//!
//! Per-call USD accounting, daily/MTD spend aggregation, budget gating, and
//! the sliding-window rate limiter. `CounterStore` stands in for the
//! external key/value store the spec treats as a read/write collaborator
//! (Redis in the system this gateway replaces); `InMemoryCounterStore` is a
//! reference adapter for tests and single-process deployments.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("counter store error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
}

/// Pricing table, USD per million tokens. Models absent here price to zero
/// — a deliberate fail-safe, not an error.
pub static PRICING_TABLE: Lazy<HashMap<&'static str, ModelPricing>> = Lazy::new(|| {
    HashMap::from([
        ("gpt-4o", ModelPricing { input_price_per_million: 2.50, output_price_per_million: 10.00 }),
        ("gpt-4o-mini", ModelPricing { input_price_per_million: 0.15, output_price_per_million: 0.60 }),
        ("o1-preview", ModelPricing { input_price_per_million: 15.00, output_price_per_million: 60.00 }),
        ("claude-3-5-sonnet-20241022", ModelPricing { input_price_per_million: 3.00, output_price_per_million: 15.00 }),
        ("claude-3-haiku-20240307", ModelPricing { input_price_per_million: 0.25, output_price_per_million: 1.25 }),
        ("deepseek-reasoner", ModelPricing { input_price_per_million: 0.55, output_price_per_million: 2.19 }),
        ("deepseek-chat", ModelPricing { input_price_per_million: 0.27, output_price_per_million: 1.10 }),
        ("gemini-1.5-pro", ModelPricing { input_price_per_million: 1.25, output_price_per_million: 5.00 }),
        ("llama-3.3-70b", ModelPricing { input_price_per_million: 0.59, output_price_per_million: 0.79 }),
        ("mistral-large-latest", ModelPricing { input_price_per_million: 2.00, output_price_per_million: 6.00 }),
    ])
});

/// `(in*price_in + out*price_out) / 1_000_000`. Unknown models yield 0.
pub fn compute_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let Some(pricing) = PRICING_TABLE.get(model) else { return 0.0 };
    (input_tokens as f64 * pricing.input_price_per_million
        + output_tokens as f64 * pricing.output_price_per_million)
        / 1_000_000.0
}

/// Abstraction over the external key/value store backing spend counters and
/// rate-limit windows. Implementations must make `incr_by` and
/// `rate_limit_check` atomic per key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn incr_by(&self, key: &str, amount: f64, ttl: Duration) -> Result<(), CounterError>;
    async fn get(&self, key: &str) -> Result<Option<f64>, CounterError>;
    /// Sliding-window check-and-admit. Prunes entries older than
    /// `now - window`; if the remaining count is below `limit`, admits and
    /// returns `(true, limit - count - 1)`; otherwise `(false, 0)`.
    async fn rate_limit_check(&self, key: &str, limit: u64, window: Duration) -> Result<(bool, u64), CounterError>;
}

struct CounterEntry {
    value: f64,
    expires_at: Instant,
}

/// Single-process reference implementation of `CounterStore`.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<String, CounterEntry>>,
    windows: Mutex<HashMap<String, Vec<Instant>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr_by(&self, key: &str, amount: f64, ttl: Duration) -> Result<(), CounterError> {
        let mut counters = self.counters.lock().await;
        let now = Instant::now();
        let entry = counters.entry(key.to_string()).or_insert(CounterEntry { value: 0.0, expires_at: now + ttl });
        if entry.expires_at <= now {
            entry.value = 0.0;
        }
        entry.value += amount;
        entry.expires_at = now + ttl;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<f64>, CounterError> {
        let counters = self.counters.lock().await;
        match counters.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value)),
            _ => Ok(None),
        }
    }

    async fn rate_limit_check(&self, key: &str, limit: u64, window: Duration) -> Result<(bool, u64), CounterError> {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let entries = windows.entry(key.to_string()).or_default();
        entries.retain(|ts| now.duration_since(*ts) < window);

        let count = entries.len() as u64;
        if count < limit {
            entries.push(now);
            Ok((true, limit - count - 1))
        } else {
            Ok((false, 0))
        }
    }
}

fn daily_key(tenant: &str, day: NaiveDate) -> String {
    format!("daily:{}:{}", tenant, day.format("%Y-%m-%d"))
}

fn mtd_key(tenant: &str, day: NaiveDate) -> String {
    format!("mtd:{}:{}-{:02}", tenant, day.year(), day.month())
}

const DAILY_TTL: Duration = Duration::from_secs(86_400 * 2);
const MTD_TTL: Duration = Duration::from_secs(86_400 * 35);

pub struct CostTracker {
    store: Arc<dyn CounterStore>,
}

impl CostTracker {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Fire-and-forget: increments daily and MTD counters. Errors are
    /// logged, never surfaced — callers must not await this for request
    /// completion.
    pub async fn record(&self, tenant: &str, cost_usd: f64) {
        let today = Utc::now().date_naive();
        if let Err(e) = self.store.incr_by(&daily_key(tenant, today), cost_usd, DAILY_TTL).await {
            tracing::error!(error = %e, tenant, "cost.record.daily.failed");
        }
        if let Err(e) = self.store.incr_by(&mtd_key(tenant, today), cost_usd, MTD_TTL).await {
            tracing::error!(error = %e, tenant, "cost.record.mtd.failed");
        }
    }

    pub async fn get_daily_spend(&self, tenant: &str, day: Option<NaiveDate>) -> f64 {
        let day = day.unwrap_or_else(|| Utc::now().date_naive());
        self.store.get(&daily_key(tenant, day)).await.ok().flatten().unwrap_or(0.0)
    }

    pub async fn get_mtd_spend(&self, tenant: &str) -> f64 {
        let today = Utc::now().date_naive();
        self.store.get(&mtd_key(tenant, today)).await.ok().flatten().unwrap_or(0.0)
    }

    pub async fn check_budget(&self, tenant: &str, daily_budget: f64) -> (bool, f64, f64) {
        let spend = self.get_daily_spend(tenant, None).await;
        let pct = spend / daily_budget.max(0.01);
        (spend < daily_budget, spend, pct)
    }

    /// Reads the tenant's current MTD spend and applies it to `budget`,
    /// latching `disabled` if the hard cap has been reached. `budget` is
    /// caller-owned; this crate holds no `BudgetRecord` state of its own.
    pub async fn evaluate_budget(&self, budget: &mut BudgetRecord) -> BudgetStatus {
        let mtd = self.get_mtd_spend(&budget.tenant_id).await;
        budget.apply_mtd_spend(mtd)
    }
}

/// Outcome of checking a tenant's MTD spend against its `BudgetRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    WithinBudget,
    CapReached,
    DisabledHardCap,
}

/// Per-tenant budget thresholds: `{monthly_cap_usd, hard_cap_usd, disabled}`.
/// `disabled` latches true once MTD spend reaches `hard_cap_usd` and is
/// never cleared automatically — a tenant must be re-enabled out of band.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BudgetRecord {
    pub tenant_id: String,
    pub monthly_cap_usd: f64,
    pub hard_cap_usd: f64,
    #[serde(default)]
    pub disabled: bool,
}

impl BudgetRecord {
    pub fn new(tenant_id: impl Into<String>, monthly_cap_usd: f64, hard_cap_usd: f64) -> Self {
        Self { tenant_id: tenant_id.into(), monthly_cap_usd, hard_cap_usd, disabled: false }
    }

    /// Pure latch: given the tenant's current MTD spend, set `disabled` once
    /// spend reaches the hard cap and report the resulting status. Once
    /// latched, subsequent calls report `DisabledHardCap` regardless of
    /// `mtd_spend_usd` — this never un-latches.
    pub fn apply_mtd_spend(&mut self, mtd_spend_usd: f64) -> BudgetStatus {
        if mtd_spend_usd >= self.hard_cap_usd {
            self.disabled = true;
        }
        if self.disabled {
            BudgetStatus::DisabledHardCap
        } else if mtd_spend_usd >= self.monthly_cap_usd {
            BudgetStatus::CapReached
        } else {
            BudgetStatus::WithinBudget
        }
    }
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    window: Duration,
    limit: u64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limit: u64, window: Duration) -> Self {
        Self { store, window, limit }
    }

    pub async fn check(&self, key: &str) -> Result<(bool, u64), CounterError> {
        self.store.rate_limit_check(key, self.limit, self.window).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_cost_is_zero_for_unknown_model() {
        assert_eq!(compute_cost("no-such-model", 1_000, 1_000), 0.0);
    }

    #[test]
    fn compute_cost_doubles_with_doubled_tokens() {
        let base = compute_cost("gpt-4o", 1_000, 2_000);
        let doubled = compute_cost("gpt-4o", 2_000, 4_000);
        assert!((doubled - base * 2.0).abs() < 1e-9);
    }

    #[test]
    fn compute_cost_is_never_negative() {
        assert!(compute_cost("gpt-4o", 0, 0) >= 0.0);
    }

    #[tokio::test]
    async fn record_and_read_back_daily_spend() {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let tracker = CostTracker::new(store);
        tracker.record("tenant-a", 1.5).await;
        tracker.record("tenant-a", 2.5).await;
        assert_eq!(tracker.get_daily_spend("tenant-a", None).await, 4.0);
        assert_eq!(tracker.get_mtd_spend("tenant-a").await, 4.0);
    }

    #[tokio::test]
    async fn missing_key_reads_as_zero() {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let tracker = CostTracker::new(store);
        assert_eq!(tracker.get_daily_spend("nobody", None).await, 0.0);
    }

    #[tokio::test]
    async fn check_budget_reports_allowed_below_cap() {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let tracker = CostTracker::new(store);
        tracker.record("tenant-a", 5.0).await;
        let (allowed, spend, pct) = tracker.check_budget("tenant-a", 10.0).await;
        assert!(allowed);
        assert_eq!(spend, 5.0);
        assert!((pct - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn check_budget_reports_not_allowed_at_or_above_cap() {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let tracker = CostTracker::new(store);
        tracker.record("tenant-a", 10.0).await;
        let (allowed, _, _) = tracker.check_budget("tenant-a", 10.0).await;
        assert!(!allowed);
    }

    #[tokio::test]
    async fn rate_limiter_never_admits_more_than_limit_within_window() {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let limiter = RateLimiter::new(store, 3, Duration::from_secs(60));
        let mut admitted = 0;
        for _ in 0..5 {
            let (ok, _) = limiter.check("tenant-a").await.unwrap();
            if ok {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
    }

    #[test]
    fn budget_within_cap_stays_enabled() {
        let mut budget = BudgetRecord::new("t1", 100.0, 120.0);
        assert_eq!(budget.apply_mtd_spend(60.0), BudgetStatus::WithinBudget);
        assert!(!budget.disabled);
    }

    #[test]
    fn budget_latches_disabled_at_hard_cap() {
        let mut budget = BudgetRecord::new("t1", 100.0, 120.0);
        assert_eq!(budget.apply_mtd_spend(60.0), BudgetStatus::WithinBudget);
        assert_eq!(budget.apply_mtd_spend(130.0), BudgetStatus::DisabledHardCap);
        assert!(budget.disabled);
    }

    #[test]
    fn budget_disabled_latch_does_not_clear_on_lower_spend() {
        let mut budget = BudgetRecord::new("t1", 100.0, 120.0);
        budget.apply_mtd_spend(130.0);
        assert!(budget.disabled);
        // a later read of a lower MTD figure (e.g. a new billing period's
        // counter not yet caught up) must not un-latch.
        assert_eq!(budget.apply_mtd_spend(0.0), BudgetStatus::DisabledHardCap);
        assert!(budget.disabled);
    }

    #[tokio::test]
    async fn evaluate_budget_reads_mtd_spend_and_latches() {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let tracker = CostTracker::new(store);
        tracker.record("t1", 60.0).await;
        tracker.record("t1", 70.0).await;

        let mut budget = BudgetRecord::new("t1", 100.0, 120.0);
        let status = tracker.evaluate_budget(&mut budget).await;
        assert_eq!(status, BudgetStatus::DisabledHardCap);
        assert!(budget.disabled);
    }

    #[tokio::test]
    async fn rate_limiter_remaining_count_decreases() {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let limiter = RateLimiter::new(store, 2, Duration::from_secs(60));
        let (ok1, remaining1) = limiter.check("k").await.unwrap();
        let (ok2, remaining2) = limiter.check("k").await.unwrap();
        assert!(ok1 && ok2);
        assert_eq!(remaining1, 1);
        assert_eq!(remaining2, 0);
    }
}
