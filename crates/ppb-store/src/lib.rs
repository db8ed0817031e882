//! Storage contracts for the bulletin, with an in-memory backend for tests
//! and local runs and a PostgreSQL backend in [`pg`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ppb_core::{
    CanonicalRecord, Cadence, Category, RecordKey, Region, SendStatus, SentLogEntry, Stats,
    Subscription,
};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub mod pg;

pub const CRATE_NAME: &str = "ppb-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt stored row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Created,
    AlreadyExists,
}

/// Result of a sent-log append. `AlreadyLogged` means another writer won the
/// uniqueness race for this (subscription, date); it is an outcome, not an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    AlreadyLogged,
}

/// Idempotent, natural-key-indexed persistence for canonical records.
#[async_trait]
pub trait ProcurementStore: Send + Sync {
    /// Inserts the record or fully replaces the row sharing its natural key.
    async fn upsert(&self, record: CanonicalRecord) -> Result<UpsertOutcome, StoreError>;

    /// Removes every record; used before a full bulk reload.
    async fn purge_all(&self) -> Result<u64, StoreError>;

    /// Creates the (product_name, region, signature_date) range index; run
    /// once per purge-and-reload cycle.
    async fn ensure_indexes(&self) -> Result<(), StoreError>;

    /// Matching records ordered by descending signature date.
    async fn find(
        &self,
        product_name: &Category,
        region: &Region,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CanonicalRecord>, StoreError>;

    /// Aggregate price statistics over matching records; `None` when nothing
    /// matches. `since: None` means all time.
    async fn stats_since(
        &self,
        region: &Region,
        product_name: &Category,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<Stats>, StoreError>;
}

/// Idempotent persistence for user subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// No-op when a subscription with the same natural key already exists.
    async fn subscribe(&self, subscription: Subscription) -> Result<SubscribeOutcome, StoreError>;

    async fn list_active(&self, user_id: &str) -> Result<Vec<Subscription>, StoreError>;

    async fn list_by_cadence(&self, cadence: Cadence) -> Result<Vec<Subscription>, StoreError>;

    /// True iff a matching row existed and was removed.
    async fn unsubscribe(&self, user_id: &str, external_id: &str) -> Result<bool, StoreError>;
}

/// Append-only dedup ledger keyed by (subscription, calendar date).
#[async_trait]
pub trait SentLog: Send + Sync {
    async fn already_sent(
        &self,
        subscription_id: Uuid,
        date: NaiveDate,
    ) -> Result<bool, StoreError>;

    async fn append(&self, entry: SentLogEntry) -> Result<AppendOutcome, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    procurements: BTreeMap<RecordKey, CanonicalRecord>,
    subscriptions: Vec<Subscription>,
    sent_log: BTreeMap<(Uuid, NaiveDate), SendStatus>,
}

/// In-memory backend. A single mutex over the whole state serializes every
/// mutation, so upserts never interleave and the sent-log check-and-insert
/// is atomic per key.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_count(&self) -> usize {
        self.inner.lock().await.procurements.len()
    }

    pub async fn sent_entries(&self) -> Vec<SentLogEntry> {
        self.inner
            .lock()
            .await
            .sent_log
            .iter()
            .map(|((subscription_id, date), status)| SentLogEntry {
                subscription_id: *subscription_id,
                date: *date,
                status: *status,
            })
            .collect()
    }
}

fn matches_query(
    record: &CanonicalRecord,
    product_name: &Category,
    region: &Region,
    since: Option<DateTime<Utc>>,
) -> bool {
    record.product_name == *product_name
        && record.region == *region
        && since.map_or(true, |cutoff| record.signature_date >= cutoff)
}

#[async_trait]
impl ProcurementStore for MemoryStore {
    async fn upsert(&self, record: CanonicalRecord) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.inner.lock().await;
        let outcome = match state.procurements.insert(record.natural_key(), record) {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };
        Ok(outcome)
    }

    async fn purge_all(&self) -> Result<u64, StoreError> {
        let mut state = self.inner.lock().await;
        let removed = state.procurements.len() as u64;
        state.procurements.clear();
        Ok(removed)
    }

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        // The natural-key map is the only index the memory backend needs.
        Ok(())
    }

    async fn find(
        &self,
        product_name: &Category,
        region: &Region,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CanonicalRecord>, StoreError> {
        let state = self.inner.lock().await;
        let mut matched: Vec<CanonicalRecord> = state
            .procurements
            .values()
            .filter(|record| matches_query(record, product_name, region, since))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.signature_date.cmp(&a.signature_date));
        Ok(matched)
    }

    async fn stats_since(
        &self,
        region: &Region,
        product_name: &Category,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<Stats>, StoreError> {
        let state = self.inner.lock().await;
        let mut count = 0u64;
        let mut total = Decimal::ZERO;
        let mut price_sum = Decimal::ZERO;
        let mut min: Option<Decimal> = None;
        let mut max: Option<Decimal> = None;

        for record in state
            .procurements
            .values()
            .filter(|record| matches_query(record, product_name, region, since))
        {
            count += 1;
            total += record.total_amount;
            price_sum += record.price;
            min = Some(min.map_or(record.price, |m| m.min(record.price)));
            max = Some(max.map_or(record.price, |m| m.max(record.price)));
        }

        match (min, max) {
            (Some(min), Some(max)) => Ok(Some(Stats {
                count,
                total,
                min,
                max,
                avg: price_sum / Decimal::from(count),
            })),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn subscribe(&self, subscription: Subscription) -> Result<SubscribeOutcome, StoreError> {
        let mut state = self.inner.lock().await;
        let duplicate = state.subscriptions.iter().any(|existing| {
            existing.user_id == subscription.user_id
                && existing.region == subscription.region
                && existing.product_name == subscription.product_name
                && existing.cadence == subscription.cadence
        });
        if duplicate {
            return Ok(SubscribeOutcome::AlreadyExists);
        }
        state.subscriptions.push(subscription);
        Ok(SubscribeOutcome::Created)
    }

    async fn list_active(&self, user_id: &str) -> Result<Vec<Subscription>, StoreError> {
        let state = self.inner.lock().await;
        let mut matched: Vec<Subscription> = state
            .subscriptions
            .iter()
            .filter(|subscription| subscription.user_id == user_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matched)
    }

    async fn list_by_cadence(&self, cadence: Cadence) -> Result<Vec<Subscription>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|subscription| subscription.cadence == cadence)
            .cloned()
            .collect())
    }

    async fn unsubscribe(&self, user_id: &str, external_id: &str) -> Result<bool, StoreError> {
        let mut state = self.inner.lock().await;
        let before = state.subscriptions.len();
        state
            .subscriptions
            .retain(|s| !(s.user_id == user_id && s.external_id == external_id));
        Ok(state.subscriptions.len() < before)
    }
}

#[async_trait]
impl SentLog for MemoryStore {
    async fn already_sent(
        &self,
        subscription_id: Uuid,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        let state = self.inner.lock().await;
        Ok(state.sent_log.contains_key(&(subscription_id, date)))
    }

    async fn append(&self, entry: SentLogEntry) -> Result<AppendOutcome, StoreError> {
        let mut state = self.inner.lock().await;
        let key = (entry.subscription_id, entry.date);
        if state.sent_log.contains_key(&key) {
            return Ok(AppendOutcome::AlreadyLogged);
        }
        state.sent_log.insert(key, entry.status);
        Ok(AppendOutcome::Appended)
    }
}
