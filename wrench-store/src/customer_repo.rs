use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use wrench_core::models::CustomerAccount;
use wrench_core::repository::{CustomerRepository, StoreResult};
use wrench_shared::Pence;

use crate::database::map_sqlx;

pub struct PgCustomerRepository {
    pool: PgPool,
}

impl PgCustomerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CustomerRow {
    email: String,
    name: String,
    phone: Option<String>,
    referral_code: String,
    referral_balance: i64,
    total_earnings: i64,
    services_booked: i64,
    referred_by: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<CustomerRow> for CustomerAccount {
    fn from(row: CustomerRow) -> Self {
        CustomerAccount {
            email: row.email,
            name: row.name,
            phone: row.phone,
            referral_code: row.referral_code,
            referral_balance: row.referral_balance,
            total_earnings: row.total_earnings,
            services_booked: row.services_booked,
            referred_by: row.referred_by,
            created_at: row.created_at,
        }
    }
}

const CUSTOMER_SELECT: &str = "SELECT email, name, phone, referral_code, referral_balance, total_earnings, \
     services_booked, referred_by, created_at FROM customers";

#[async_trait]
impl CustomerRepository for PgCustomerRepository {
    async fn create(&self, account: &CustomerAccount) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customers (email, name, phone, referral_code, referral_balance, total_earnings,
                services_booked, referred_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&account.email)
        .bind(&account.name)
        .bind(&account.phone)
        .bind(&account.referral_code)
        .bind(account.referral_balance)
        .bind(account.total_earnings)
        .bind(account.services_booked)
        .bind(&account.referred_by)
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn get(&self, email: &str) -> StoreResult<Option<CustomerAccount>> {
        let row = sqlx::query_as::<_, CustomerRow>(&format!("{} WHERE email = $1", CUSTOMER_SELECT))
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok(row.map(CustomerAccount::from))
    }

    async fn find_by_code(&self, code: &str) -> StoreResult<Option<CustomerAccount>> {
        let row = sqlx::query_as::<_, CustomerRow>(&format!("{} WHERE referral_code = $1", CUSTOMER_SELECT))
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok(row.map(CustomerAccount::from))
    }

    async fn set_referred_by(&self, email: &str, code: &str) -> StoreResult<()> {
        sqlx::query("UPDATE customers SET referred_by = $1 WHERE email = $2 AND referred_by IS NULL")
            .bind(code)
            .bind(email)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn debit_earnings(&self, email: &str, amount: Pence) -> StoreResult<bool> {
        // The WHERE guard refuses the debit rather than clamping it
        let result = sqlx::query(
            r#"
            UPDATE customers
            SET total_earnings = total_earnings - $1,
                referral_balance = GREATEST(referral_balance - $1, 0)
            WHERE email = $2 AND total_earnings >= $1
            "#,
        )
        .bind(amount)
        .bind(email)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    async fn increment_services_booked(&self, email: &str) -> StoreResult<Option<i64>> {
        let previous: Option<(i64,)> = sqlx::query_as(
            "UPDATE customers SET services_booked = services_booked + 1 WHERE email = $1 RETURNING services_booked - 1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(previous.map(|(count,)| count))
    }
}
