//! PostgreSQL backend. Upserts ride on the natural-key primary key with
//! `ON CONFLICT DO UPDATE`; the sent-log unique constraint turns the
//! check-then-append race into a first-writer-wins insert.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ppb_core::{CanonicalRecord, Cadence, Category, Region, SentLogEntry, Stats, Subscription};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{
    AppendOutcome, ProcurementStore, SentLog, StoreError, SubscribeOutcome, SubscriptionStore,
    UpsertOutcome,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<CanonicalRecord, StoreError> {
    let region_raw: String = row.try_get("region")?;
    let category_raw: String = row.try_get("product_name")?;
    let participants: i32 = row.try_get("participants")?;
    Ok(CanonicalRecord {
        contract_id: row.try_get("contract_id")?,
        signature_date: row.try_get("signature_date")?,
        buyer: row.try_get("buyer")?,
        seller: row.try_get("seller")?,
        total_amount: row.try_get("total_amount")?,
        participants: u32::try_from(participants)
            .map_err(|_| StoreError::Corrupt(format!("negative participants {participants}")))?,
        product_name: Category::parse(&category_raw)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown category {category_raw:?}")))?,
        product_details: row.try_get("product_details")?,
        product_hash: row.try_get("product_hash")?,
        price: row.try_get("price")?,
        region: Region::parse(&region_raw)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown region {region_raw:?}")))?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription, StoreError> {
    let region_raw: String = row.try_get("region")?;
    let category_raw: String = row.try_get("product_name")?;
    let cadence_raw: String = row.try_get("cadence")?;
    Ok(Subscription {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        region: Region::parse(&region_raw)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown region {region_raw:?}")))?,
        product_name: Category::parse(&category_raw)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown category {category_raw:?}")))?,
        cadence: Cadence::parse(&cadence_raw)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown cadence {cadence_raw:?}")))?,
        external_id: row.try_get("external_id")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ProcurementStore for PgStore {
    async fn upsert(&self, record: CanonicalRecord) -> Result<UpsertOutcome, StoreError> {
        // xmax = 0 only on freshly inserted tuples, which distinguishes the
        // insert path from the conflict-update path in one round trip.
        let row = sqlx::query(
            r#"
            INSERT INTO procurements (
                contract_id, product_name, product_hash, signature_date,
                buyer, seller, total_amount, participants,
                product_details, price, region
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (contract_id, product_name, product_hash) DO UPDATE SET
                signature_date = EXCLUDED.signature_date,
                buyer = EXCLUDED.buyer,
                seller = EXCLUDED.seller,
                total_amount = EXCLUDED.total_amount,
                participants = EXCLUDED.participants,
                product_details = EXCLUDED.product_details,
                price = EXCLUDED.price,
                region = EXCLUDED.region
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&record.contract_id)
        .bind(record.product_name.as_str())
        .bind(&record.product_hash)
        .bind(record.signature_date)
        .bind(&record.buyer)
        .bind(&record.seller)
        .bind(record.total_amount)
        .bind(record.participants as i32)
        .bind(&record.product_details)
        .bind(record.price)
        .bind(record.region.as_str())
        .fetch_one(&self.pool)
        .await?;

        if row.try_get::<bool, _>("inserted")? {
            Ok(UpsertOutcome::Inserted)
        } else {
            Ok(UpsertOutcome::Updated)
        }
    }

    async fn purge_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM procurements")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_procurements_window \
             ON procurements (product_name, region, signature_date)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(
        &self,
        product_name: &Category,
        region: &Region,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CanonicalRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT contract_id, product_name, product_hash, signature_date,
                   buyer, seller, total_amount, participants,
                   product_details, price, region
            FROM procurements
            WHERE product_name = $1
              AND region = $2
              AND ($3::timestamptz IS NULL OR signature_date >= $3)
            ORDER BY signature_date DESC
            "#,
        )
        .bind(product_name.as_str())
        .bind(region.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn stats_since(
        &self,
        region: &Region,
        product_name: &Category,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<Stats>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count,
                   SUM(total_amount) AS total,
                   MIN(price) AS min,
                   MAX(price) AS max,
                   AVG(price) AS avg
            FROM procurements
            WHERE region = $1
              AND product_name = $2
              AND ($3::timestamptz IS NULL OR signature_date >= $3)
            "#,
        )
        .bind(region.as_str())
        .bind(product_name.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("count")?;
        if count == 0 {
            return Ok(None);
        }

        let field = |name: &str| -> Result<Decimal, StoreError> {
            row.try_get::<Option<Decimal>, _>(name)?
                .ok_or_else(|| StoreError::Corrupt(format!("null aggregate {name} with count {count}")))
        };

        Ok(Some(Stats {
            count: count as u64,
            total: field("total")?,
            min: field("min")?,
            max: field("max")?,
            avg: field("avg")?,
        }))
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn subscribe(&self, subscription: Subscription) -> Result<SubscribeOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, region, product_name, cadence, external_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, region, product_name, cadence) DO NOTHING
            "#,
        )
        .bind(subscription.id)
        .bind(&subscription.user_id)
        .bind(subscription.region.as_str())
        .bind(subscription.product_name.as_str())
        .bind(subscription.cadence.as_str())
        .bind(&subscription.external_id)
        .bind(subscription.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(SubscribeOutcome::Created)
        } else {
            Ok(SubscribeOutcome::AlreadyExists)
        }
    }

    async fn list_active(&self, user_id: &str) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, region, product_name, cadence, external_id, created_at \
             FROM subscriptions WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(subscription_from_row).collect()
    }

    async fn list_by_cadence(&self, cadence: Cadence) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, region, product_name, cadence, external_id, created_at \
             FROM subscriptions WHERE cadence = $1 ORDER BY created_at",
        )
        .bind(cadence.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(subscription_from_row).collect()
    }

    async fn unsubscribe(&self, user_id: &str, external_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM subscriptions WHERE user_id = $1 AND external_id = $2",
        )
        .bind(user_id)
        .bind(external_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SentLog for PgStore {
    async fn already_sent(
        &self,
        subscription_id: Uuid,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM sent_log WHERE subscription_id = $1 AND date = $2) AS sent",
        )
        .bind(subscription_id)
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<bool, _>("sent")?)
    }

    async fn append(&self, entry: SentLogEntry) -> Result<AppendOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sent_log (subscription_id, date, status)
            VALUES ($1, $2, $3)
            ON CONFLICT (subscription_id, date) DO NOTHING
            "#,
        )
        .bind(entry.subscription_id)
        .bind(entry.date)
        .bind(entry.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(AppendOutcome::Appended)
        } else {
            Ok(AppendOutcome::AlreadyLogged)
        }
    }
}

#[cfg(test)]
mod tests {
    use ppb_core::SendStatus;

    #[test]
    fn send_status_round_trips_through_its_text_form() {
        for status in [SendStatus::Ok, SendStatus::Fail] {
            assert_eq!(SendStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SendStatus::parse("retry"), None);
    }
}
