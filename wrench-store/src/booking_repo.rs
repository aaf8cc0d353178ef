use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;
use wrench_core::models::{
    Booking, BookingStatus, BookingTotals, CustomerSnapshot, PaymentStatus, ServiceLine, VehicleSnapshot,
};
use wrench_core::repository::{BookingRepository, StoreResult};

use crate::database::{map_sqlx, parse_column};

pub struct PgBookingRepository {
    pool: PgPool,
}

impl PgBookingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const BOOKING_COLUMNS: &str = "id, payment_session_id, customer_name, customer_email, customer_phone, \
     vehicle_make, vehicle_model, vehicle_year, vehicle_registration, services, \
     subtotal, labour_cost, parts_cost, vat, nominal_total, earnings_applied, total, amount_captured, \
     status, payment_status, scheduled_date, scheduled_time, source, ledger_settled, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    payment_session_id: Option<String>,
    customer_name: String,
    customer_email: String,
    customer_phone: Option<String>,
    vehicle_make: String,
    vehicle_model: String,
    vehicle_year: Option<i32>,
    vehicle_registration: String,
    services: Json<Vec<ServiceLine>>,
    subtotal: i64,
    labour_cost: i64,
    parts_cost: i64,
    vat: i64,
    nominal_total: i64,
    earnings_applied: i64,
    total: i64,
    amount_captured: Option<i64>,
    status: String,
    payment_status: String,
    scheduled_date: NaiveDate,
    scheduled_time: NaiveTime,
    source: String,
    ledger_settled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = wrench_core::StoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            payment_session_id: row.payment_session_id,
            customer: CustomerSnapshot {
                name: row.customer_name,
                email: row.customer_email,
                phone: row.customer_phone,
            },
            vehicle: VehicleSnapshot {
                make: row.vehicle_make,
                model: row.vehicle_model,
                year: row.vehicle_year,
                registration: row.vehicle_registration,
            },
            services: row.services.0,
            totals: BookingTotals {
                subtotal: row.subtotal,
                labour_cost: row.labour_cost,
                parts_cost: row.parts_cost,
                vat: row.vat,
                nominal_total: row.nominal_total,
                earnings_applied: row.earnings_applied,
                total: row.total,
                amount_captured: row.amount_captured,
            },
            status: parse_column(&row.status)?,
            payment_status: parse_column(&row.payment_status)?,
            scheduled_date: row.scheduled_date,
            scheduled_time: row.scheduled_time,
            source: parse_column(&row.source)?,
            ledger_settled: row.ledger_settled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl BookingRepository for PgBookingRepository {
    async fn insert(&self, booking: &Booking) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bookings (id, payment_session_id, customer_name, customer_email, customer_phone,
                vehicle_make, vehicle_model, vehicle_year, vehicle_registration, primary_service_label, services,
                subtotal, labour_cost, parts_cost, vat, nominal_total, earnings_applied, total, amount_captured,
                status, payment_status, scheduled_date, scheduled_time, source, ledger_settled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19,
                $20, $21, $22, $23, $24, $25, $26, $27)
            "#,
        )
        .bind(booking.id)
        .bind(&booking.payment_session_id)
        .bind(&booking.customer.name)
        .bind(&booking.customer.email)
        .bind(&booking.customer.phone)
        .bind(&booking.vehicle.make)
        .bind(&booking.vehicle.model)
        .bind(booking.vehicle.year)
        .bind(&booking.vehicle.registration)
        .bind(booking.primary_label().unwrap_or_default())
        .bind(Json(&booking.services))
        .bind(booking.totals.subtotal)
        .bind(booking.totals.labour_cost)
        .bind(booking.totals.parts_cost)
        .bind(booking.totals.vat)
        .bind(booking.totals.nominal_total)
        .bind(booking.totals.earnings_applied)
        .bind(booking.totals.total)
        .bind(booking.totals.amount_captured)
        .bind(booking.status.as_str())
        .bind(booking.payment_status.as_str())
        .bind(booking.scheduled_date)
        .bind(booking.scheduled_time)
        .bind(booking.source.as_str())
        .bind(booking.ledger_settled)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(&format!("SELECT {} FROM bookings WHERE id = $1", BOOKING_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        row.map(Booking::try_from).transpose()
    }

    async fn find_by_session(&self, session_id: &str) -> StoreResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} FROM bookings WHERE payment_session_id = $1",
            BOOKING_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.map(Booking::try_from).transpose()
    }

    async fn find_recent_match(
        &self,
        customer_email: &str,
        registration: &str,
        service_label: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} FROM bookings \
             WHERE customer_email = $1 AND vehicle_registration = $2 AND primary_service_label = $3 \
               AND created_at >= $4 AND status <> 'cancelled' \
             ORDER BY created_at DESC LIMIT 1",
            BOOKING_COLUMNS
        ))
        .bind(customer_email)
        .bind(registration)
        .bind(service_label)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.map(Booking::try_from).transpose()
    }

    async fn list_by_customer(&self, customer_email: &str) -> StoreResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} FROM bookings WHERE customer_email = $1 ORDER BY scheduled_date DESC, created_at DESC",
            BOOKING_COLUMNS
        ))
        .bind(customer_email)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.into_iter().map(Booking::try_from).collect()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: BookingStatus,
        payment_status: PaymentStatus,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE bookings SET status = $1, payment_status = $2, updated_at = NOW() WHERE id = $3",
        )
        .bind(status.as_str())
        .bind(payment_status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(wrench_core::StoreError::NotFound(format!("booking {}", id)));
        }
        Ok(())
    }

    async fn claim_settlement(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE bookings SET ledger_settled = TRUE, updated_at = NOW() WHERE id = $1 AND ledger_settled = FALSE",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    async fn attach_session(&self, id: Uuid, session_id: &str) -> StoreResult<bool> {
        // The partial unique index turns a session owned elsewhere into a unique violation
        let result = sqlx::query(
            "UPDATE bookings SET payment_session_id = $1, updated_at = NOW() WHERE id = $2 AND payment_session_id IS NULL",
        )
        .bind(session_id)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(result.rows_affected() == 1)
    }
}
