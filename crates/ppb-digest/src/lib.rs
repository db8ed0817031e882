//! Windowed statistics ladder and the digest dispatcher.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, FixedOffset, Months, NaiveDate, NaiveTime, Utc, Weekday};
use ppb_core::{Cadence, Category, Region, SendStatus, SentLogEntry, Stats, Subscription};
use ppb_store::{AppendOutcome, ProcurementStore, SentLog, StoreError, SubscriptionStore};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ppb-digest";

/// Fixed ladder of trailing lookback windows, in presentation order.
pub const WINDOW_LADDER: &[(&str, WindowKind)] = &[
    ("last day", WindowKind::Days(1)),
    ("last week", WindowKind::Days(7)),
    ("last month", WindowKind::LastMonth),
    ("all time", WindowKind::AllTime),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Days(i64),
    LastMonth,
    AllTime,
}

impl WindowKind {
    pub fn start(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            WindowKind::Days(days) => Some(now - Duration::days(days)),
            WindowKind::LastMonth => Some(now.checked_sub_months(Months::new(1)).unwrap_or(now)),
            WindowKind::AllTime => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub label: &'static str,
    pub start: Option<DateTime<Utc>>,
    pub stats: Stats,
}

/// Evaluates the full ladder, each window independently against the whole
/// record set. Windows with no matching data are omitted; if every window is
/// empty the result is `None`.
pub async fn stats_ladder(
    store: &dyn ProcurementStore,
    region: &Region,
    product_name: &Category,
    now: DateTime<Utc>,
) -> Result<Option<Vec<WindowStats>>, StoreError> {
    let mut windows = Vec::new();
    for (label, kind) in WINDOW_LADDER.iter().copied() {
        let start = kind.start(now);
        if let Some(stats) = store.stats_since(region, product_name, start).await? {
            windows.push(WindowStats {
                label,
                start,
                stats,
            });
        }
    }
    Ok(if windows.is_empty() {
        None
    } else {
        Some(windows)
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Structured digest payload handed to the external messaging transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestMessage {
    pub subscription_id: Uuid,
    pub region: Region,
    pub product_name: Category,
    pub cadence: Cadence,
    pub window_start: DateTime<Utc>,
    pub text: String,
    pub stats: Stats,
}

/// Delivery seam. The dispatcher neither knows nor cares which transport
/// sits behind it.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, recipient: &str, message: &DigestMessage) -> Result<(), DeliveryError>;
}

fn window_phrase(cadence: Cadence) -> &'static str {
    match cadence {
        Cadence::Daily => "за останній день",
        Cadence::Weekly => "за останній тиждень",
        Cadence::Monthly => "за останній місяць",
    }
}

/// Summary text in the shape the bulletin has always sent.
pub fn compose_digest(
    subscription: &Subscription,
    window_start: DateTime<Utc>,
    stats: &Stats,
) -> DigestMessage {
    let text = format!(
        "”{product}” в області ”{region}” {phrase}:\n\
         Всього закупівель: {count} на суму {total}\n\
         Мінімальна ціна: {min}\n\
         Максимальна ціна: {max}\n\
         Середня ціна: {avg}",
        product = subscription.product_name.as_str(),
        region = subscription.region.as_str(),
        phrase = window_phrase(subscription.cadence),
        count = stats.count,
        total = stats.total,
        min = stats.min,
        max = stats.max,
        avg = stats.avg,
    );
    DigestMessage {
        subscription_id: subscription.id,
        region: subscription.region.clone(),
        product_name: subscription.product_name.clone(),
        cadence: subscription.cadence,
        window_start,
        text,
        stats: stats.clone(),
    }
}

/// Local calendar for the dispatcher: the configured offset plus the weekly
/// anchor day, applied once per run.
#[derive(Debug, Clone, Copy)]
pub struct DigestCalendar {
    pub tz: FixedOffset,
    pub weekly_anchor: Weekday,
}

impl DigestCalendar {
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// Cadences due on a local date: daily always, weekly on the anchor day,
    /// monthly on the first of the month.
    pub fn due_cadences(&self, today: NaiveDate) -> Vec<Cadence> {
        let mut due = vec![Cadence::Daily];
        if today.weekday() == self.weekly_anchor {
            due.push(Cadence::Weekly);
        }
        if today.day() == 1 {
            due.push(Cadence::Monthly);
        }
        due
    }

    /// UTC instant of local midnight on the first day of the cadence span.
    pub fn window_start(&self, cadence: Cadence, today: NaiveDate) -> DateTime<Utc> {
        cadence
            .span_start(today)
            .and_time(NaiveTime::MIN)
            .and_local_timezone(self.tz)
            .single()
            .expect("fixed offsets have no calendar gaps")
            .with_timezone(&Utc)
    }
}

/// Per-run counts, logged for the operator.
#[derive(Debug, Clone, Serialize)]
pub struct DigestRunSummary {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub due_cadences: Vec<Cadence>,
    pub sent: BTreeMap<Cadence, usize>,
    pub skipped_already_sent: usize,
    pub no_data: usize,
    pub failed: usize,
}

pub struct DigestDispatcher {
    store: Arc<dyn ProcurementStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    sent_log: Arc<dyn SentLog>,
    messenger: Arc<dyn Messenger>,
    calendar: DigestCalendar,
}

impl DigestDispatcher {
    pub fn new(
        store: Arc<dyn ProcurementStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        sent_log: Arc<dyn SentLog>,
        messenger: Arc<dyn Messenger>,
        calendar: DigestCalendar,
    ) -> Self {
        Self {
            store,
            subscriptions,
            sent_log,
            messenger,
            calendar,
        }
    }

    /// One scheduled run. The sent log gates every subscription to at most
    /// one attempt per calendar day; a delivery failure is confined to its
    /// subscription, logged `fail`, counted, and the run moves on.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<DigestRunSummary, StoreError> {
        let run_id = Uuid::new_v4();
        let today = self.calendar.today(now);
        let due = self.calendar.due_cadences(today);
        info!(%run_id, %today, ?due, "digest run started");

        let mut summary = DigestRunSummary {
            run_id,
            date: today,
            due_cadences: due.clone(),
            sent: BTreeMap::new(),
            skipped_already_sent: 0,
            no_data: 0,
            failed: 0,
        };

        for cadence in due {
            let mut sent_count = 0usize;
            for subscription in self.subscriptions.list_by_cadence(cadence).await? {
                if self.sent_log.already_sent(subscription.id, today).await? {
                    summary.skipped_already_sent += 1;
                    continue;
                }

                let window_start = self.calendar.window_start(cadence, today);
                let stats = self
                    .store
                    .stats_since(&subscription.region, &subscription.product_name, Some(window_start))
                    .await?;

                let Some(stats) = stats else {
                    // No data in the window: mark the day processed so the
                    // subscription is not retried until tomorrow.
                    self.sent_log
                        .append(SentLogEntry {
                            subscription_id: subscription.id,
                            date: today,
                            status: SendStatus::Ok,
                        })
                        .await?;
                    summary.no_data += 1;
                    continue;
                };

                let message = compose_digest(&subscription, window_start, &stats);
                match self.messenger.send(&subscription.user_id, &message).await {
                    Ok(()) => {
                        let appended = self
                            .sent_log
                            .append(SentLogEntry {
                                subscription_id: subscription.id,
                                date: today,
                                status: SendStatus::Ok,
                            })
                            .await?;
                        match appended {
                            AppendOutcome::Appended => sent_count += 1,
                            // An overlapping run delivered first.
                            AppendOutcome::AlreadyLogged => summary.skipped_already_sent += 1,
                        }
                    }
                    Err(err) => {
                        warn!(subscription_id = %subscription.id, error = %err, "digest delivery failed");
                        self.sent_log
                            .append(SentLogEntry {
                                subscription_id: subscription.id,
                                date: today,
                                status: SendStatus::Fail,
                            })
                            .await?;
                        summary.failed += 1;
                    }
                }
            }
            summary.sent.insert(cadence, sent_count);
        }

        info!(
            %run_id,
            sent = ?summary.sent,
            skipped = summary.skipped_already_sent,
            no_data = summary.no_data,
            failed = summary.failed,
            "digest run finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ppb_store::MemoryStore;
    use rust_decimal::Decimal;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingMessenger {
        sent: Mutex<Vec<(String, DigestMessage)>>,
        fail_for: Option<String>,
    }

    impl RecordingMessenger {
        fn failing_for(user_id: &str) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_for: Some(user_id.to_string()),
            }
        }

        async fn delivered(&self) -> usize {
            self.sent.lock().await.len()
        }
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        async fn send(
            &self,
            recipient: &str,
            message: &DigestMessage,
        ) -> Result<(), DeliveryError> {
            if self.fail_for.as_deref() == Some(recipient) {
                return Err(DeliveryError::Failed("transport said no".to_string()));
            }
            self.sent
                .lock()
                .await
                .push((recipient.to_string(), message.clone()));
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).single().unwrap()
    }

    fn calendar() -> DigestCalendar {
        DigestCalendar {
            tz: FixedOffset::east_opt(2 * 3600).unwrap(),
            weekly_anchor: Weekday::Mon,
        }
    }

    fn record(contract_id: &str, age: Duration, price: i64) -> ppb_core::CanonicalRecord {
        ppb_core::CanonicalRecord {
            contract_id: contract_id.to_string(),
            signature_date: now() - age,
            buyer: "Школа №1".to_string(),
            seller: "ТОВ Постачальник".to_string(),
            total_amount: Decimal::from(price * 10),
            participants: 2,
            product_name: Category::parse("мед").unwrap(),
            product_details: contract_id.to_string(),
            product_hash: contract_id.to_string(),
            price: Decimal::from(price),
            region: Region::parse("полтавська").unwrap(),
        }
    }

    fn honey() -> Category {
        Category::parse("мед").unwrap()
    }

    fn poltavska() -> Region {
        Region::parse("полтавська").unwrap()
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.upsert(record("c-today", Duration::hours(1), 100)).await.unwrap();
        store.upsert(record("c-3d", Duration::days(3), 110)).await.unwrap();
        store.upsert(record("c-10d", Duration::days(10), 120)).await.unwrap();
        store.upsert(record("c-40d", Duration::days(40), 130)).await.unwrap();
        store
    }

    fn dispatcher(store: Arc<MemoryStore>, messenger: Arc<RecordingMessenger>) -> DigestDispatcher {
        DigestDispatcher::new(store.clone(), store.clone(), store, messenger, calendar())
    }

    #[tokio::test]
    async fn ladder_windows_are_independent_not_cumulative() {
        let store = seeded_store().await;
        let ladder = stats_ladder(store.as_ref(), &poltavska(), &honey(), now())
            .await
            .unwrap()
            .unwrap();

        let counts: Vec<(&str, u64)> = ladder
            .iter()
            .map(|w| (w.label, w.stats.count))
            .collect();
        assert_eq!(
            counts,
            vec![("last day", 1), ("last week", 2), ("last month", 3), ("all time", 4)]
        );
        assert!(ladder.last().unwrap().start.is_none());
    }

    #[tokio::test]
    async fn ladder_with_no_data_at_all_is_absent() {
        let store = Arc::new(MemoryStore::new());
        let ladder = stats_ladder(store.as_ref(), &poltavska(), &honey(), now())
            .await
            .unwrap();
        assert!(ladder.is_none());
    }

    #[tokio::test]
    async fn second_run_on_the_same_day_delivers_nothing() {
        let store = seeded_store().await;
        let messenger = Arc::new(RecordingMessenger::default());
        let subscription = Subscription::new("user-1", poltavska(), honey(), Cadence::Daily);
        store.subscribe(subscription).await.unwrap();

        let dispatcher = dispatcher(store.clone(), messenger.clone());
        let first = dispatcher.run_once(now()).await.unwrap();
        assert_eq!(first.sent.get(&Cadence::Daily), Some(&1));
        assert_eq!(messenger.delivered().await, 1);

        let second = dispatcher.run_once(now()).await.unwrap();
        assert_eq!(second.sent.get(&Cadence::Daily), Some(&0));
        assert_eq!(second.skipped_already_sent, 1);
        assert_eq!(messenger.delivered().await, 1);
        assert_eq!(store.sent_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn delivery_failure_is_confined_to_its_subscription() {
        let store = seeded_store().await;
        let messenger = Arc::new(RecordingMessenger::failing_for("user-broken"));
        store
            .subscribe(Subscription::new("user-broken", poltavska(), honey(), Cadence::Daily))
            .await
            .unwrap();
        store
            .subscribe(Subscription::new("user-fine", poltavska(), honey(), Cadence::Daily))
            .await
            .unwrap();

        let dispatcher = dispatcher(store.clone(), messenger.clone());
        let summary = dispatcher.run_once(now()).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.sent.get(&Cadence::Daily), Some(&1));
        assert_eq!(messenger.delivered().await, 1);

        let entries = store.sent_entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries.iter().filter(|e| e.status == SendStatus::Fail).count(),
            1
        );
    }

    #[tokio::test]
    async fn no_data_subscription_is_marked_processed_without_delivery() {
        let store = Arc::new(MemoryStore::new());
        let messenger = Arc::new(RecordingMessenger::default());
        store
            .subscribe(Subscription::new("user-1", poltavska(), honey(), Cadence::Daily))
            .await
            .unwrap();

        let dispatcher = dispatcher(store.clone(), messenger.clone());
        let summary = dispatcher.run_once(now()).await.unwrap();

        assert_eq!(summary.no_data, 1);
        assert_eq!(summary.sent.get(&Cadence::Daily), Some(&0));
        assert_eq!(messenger.delivered().await, 0);
        let entries = store.sent_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, SendStatus::Ok);
    }

    #[tokio::test]
    async fn weekly_and_monthly_wait_for_their_days() {
        let store = seeded_store().await;
        let messenger = Arc::new(RecordingMessenger::default());
        store
            .subscribe(Subscription::new("user-1", poltavska(), honey(), Cadence::Weekly))
            .await
            .unwrap();

        // 2026-08-30 is a Sunday; the anchor is Monday, so only daily is due.
        let dispatcher = dispatcher(store.clone(), messenger.clone());
        let summary = dispatcher.run_once(now()).await.unwrap();
        assert_eq!(summary.due_cadences, vec![Cadence::Daily]);
        assert_eq!(messenger.delivered().await, 0);

        let cal = calendar();
        let monday = NaiveDate::from_ymd_opt(2026, 8, 31).unwrap();
        assert_eq!(cal.due_cadences(monday), vec![Cadence::Daily, Cadence::Weekly]);
        let first_of_month = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap();
        assert_eq!(
            cal.due_cadences(first_of_month),
            vec![Cadence::Daily, Cadence::Monthly]
        );
    }

    #[test]
    fn digest_text_carries_the_window_and_the_numbers() {
        let subscription = Subscription::new("user-1", poltavska(), honey(), Cadence::Weekly);
        let stats = Stats {
            count: 2,
            total: Decimal::from(2100),
            min: Decimal::from(100),
            max: Decimal::from(110),
            avg: Decimal::from(105),
        };
        let message = compose_digest(&subscription, now(), &stats);
        assert!(message.text.contains("за останній тиждень"));
        assert!(message.text.contains("Всього закупівель: 2 на суму 2100"));
        assert!(message.text.contains("Середня ціна: 105"));
    }
}
