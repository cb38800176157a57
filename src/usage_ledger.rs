// Per-identity daily usage accounting.
// Every admitted processing call consumes one slot from a fixed daily allowance
// keyed by identity. Counters are scoped to the current UTC day.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use std::sync::Arc;

/// Source of "today" for the ledger. Swappable so day rollover can be tested.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Wall clock, truncated to the UTC calendar day.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

/// Usage for one identity on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageRecord {
    pub day: NaiveDate,
    pub count: u32,
}

/// Outcome of a consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: u32,
}

/// Daily quota store.
///
/// `try_consume` must check and increment as one step: two concurrent calls for
/// the same identity can never both observe the last free slot.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Consumes one slot for `identity` if fewer than `limit` were used today.
    async fn try_consume(&self, identity: &str, limit: u32) -> QuotaDecision;

    /// Remaining slots for `identity` today. Never mutates.
    async fn peek(&self, identity: &str, limit: u32) -> u32;

    /// Drops records from past days. Returns how many were removed.
    async fn purge_stale(&self) -> usize;
}

pub type SharedUsageLedger = Arc<dyn UsageLedger>;

/// Process-local ledger. Not shared across instances: every server process
/// enforces its own independent quota.
pub struct InMemoryUsageLedger {
    records: DashMap<String, UsageRecord>,
    clock: Arc<dyn Clock>,
}

impl InMemoryUsageLedger {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    #[cfg(test)]
    fn record(&self, identity: &str) -> Option<UsageRecord> {
        self.records.get(identity).map(|r| *r)
    }

    #[cfg(test)]
    fn insert(&self, identity: &str, record: UsageRecord) {
        self.records.insert(identity.to_string(), record);
    }
}

impl Default for InMemoryUsageLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageLedger for InMemoryUsageLedger {
    async fn try_consume(&self, identity: &str, limit: u32) -> QuotaDecision {
        let today = self.clock.today();

        // The entry holds the shard lock until it is dropped, so the read and
        // the write below cannot interleave with another caller.
        let entry = self.records.entry(identity.to_string());

        let used = match &entry {
            Entry::Occupied(o) if o.get().day == today => o.get().count,
            _ => 0,
        };
        if used >= limit {
            return QuotaDecision {
                allowed: false,
                remaining: 0,
            };
        }

        let count = used + 1;
        entry.insert(UsageRecord { day: today, count });

        QuotaDecision {
            allowed: true,
            remaining: limit - count,
        }
    }

    async fn peek(&self, identity: &str, limit: u32) -> u32 {
        let today = self.clock.today();
        let used = self
            .records
            .get(identity)
            .filter(|r| r.day == today)
            .map(|r| r.count)
            .unwrap_or(0);
        limit.saturating_sub(used)
    }

    async fn purge_stale(&self) -> usize {
        let today = self.clock.today();
        let before = self.records.len();
        self.records.retain(|_, r| r.day >= today);
        before - self.records.len()
    }
}

/// Periodically evicts past-day records until the process exits.
pub fn spawn_purge_task(ledger: SharedUsageLedger, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick completes immediately; nothing is stale at startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = ledger.purge_stale().await;
            if removed > 0 {
                tracing::debug!("Purged {} stale usage record(s)", removed);
            }
        }
    });
}
