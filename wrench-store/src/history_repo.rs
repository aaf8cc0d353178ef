use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;
use wrench_core::models::{BookingStatus, HistoryRecord, ServiceLine, VehicleSnapshot};
use wrench_core::repository::{HistoryRepository, StoreResult};

use crate::database::{map_sqlx, parse_column};

pub struct PgHistoryRepository {
    pool: PgPool,
}

impl PgHistoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    history_key: String,
    booking_id: Uuid,
    payment_session_id: Option<String>,
    customer_email: String,
    vehicle: Json<VehicleSnapshot>,
    service: Json<ServiceLine>,
    earnings_applied: i64,
    amount_charged: i64,
    status: String,
    service_date: NaiveDate,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for HistoryRecord {
    type Error = wrench_core::StoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(HistoryRecord {
            id: row.id,
            history_key: row.history_key,
            booking_id: row.booking_id,
            payment_session_id: row.payment_session_id,
            customer_email: row.customer_email,
            vehicle: row.vehicle.0,
            service: row.service.0,
            earnings_applied: row.earnings_applied,
            amount_charged: row.amount_charged,
            status: parse_column(&row.status)?,
            service_date: row.service_date,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const HISTORY_SELECT: &str = "SELECT id, history_key, booking_id, payment_session_id, customer_email, vehicle, service, \
     earnings_applied, amount_charged, status, service_date, created_at, updated_at FROM service_history";

#[async_trait]
impl HistoryRepository for PgHistoryRepository {
    async fn insert(&self, record: &HistoryRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO service_history (id, history_key, booking_id, payment_session_id, customer_email,
                vehicle, service, earnings_applied, amount_charged, status, service_date, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.id)
        .bind(&record.history_key)
        .bind(record.booking_id)
        .bind(&record.payment_session_id)
        .bind(&record.customer_email)
        .bind(Json(&record.vehicle))
        .bind(Json(&record.service))
        .bind(record.earnings_applied)
        .bind(record.amount_charged)
        .bind(record.status.as_str())
        .bind(record.service_date)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn find_by_key(&self, history_key: &str) -> StoreResult<Option<HistoryRecord>> {
        let row = sqlx::query_as::<_, HistoryRow>(&format!("{} WHERE history_key = $1", HISTORY_SELECT))
            .bind(history_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        row.map(HistoryRecord::try_from).transpose()
    }

    async fn list_by_booking(&self, booking_id: Uuid) -> StoreResult<Vec<HistoryRecord>> {
        let rows = sqlx::query_as::<_, HistoryRow>(&format!(
            "{} WHERE booking_id = $1 ORDER BY created_at",
            HISTORY_SELECT
        ))
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.into_iter().map(HistoryRecord::try_from).collect()
    }

    async fn list_by_customer(&self, customer_email: &str) -> StoreResult<Vec<HistoryRecord>> {
        let rows = sqlx::query_as::<_, HistoryRow>(&format!(
            "{} WHERE customer_email = $1 ORDER BY service_date DESC",
            HISTORY_SELECT
        ))
        .bind(customer_email)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.into_iter().map(HistoryRecord::try_from).collect()
    }

    async fn update_status_for_booking(&self, booking_id: Uuid, status: BookingStatus) -> StoreResult<()> {
        sqlx::query("UPDATE service_history SET status = $1, updated_at = NOW() WHERE booking_id = $2")
            .bind(status.as_str())
            .bind(booking_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}
