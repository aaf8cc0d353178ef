use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;
use wrench_core::models::Referral;
use wrench_core::repository::{ReferralRepository, StoreResult};
use wrench_core::StoreError;
use wrench_shared::pii::masked;

use crate::database::{map_sqlx, parse_column};

pub struct PgReferralRepository {
    pool: PgPool,
}

impl PgReferralRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ReferralRow {
    id: Uuid,
    referrer_email: String,
    code: String,
    referred_email: String,
    referred_name: String,
    status: String,
    bonus_amount: i64,
    bonus_paid: bool,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReferralRow> for Referral {
    type Error = wrench_core::StoreError;

    fn try_from(row: ReferralRow) -> Result<Self, Self::Error> {
        Ok(Referral {
            id: row.id,
            referrer_email: row.referrer_email,
            code: row.code,
            referred_email: row.referred_email,
            referred_name: row.referred_name,
            status: parse_column(&row.status)?,
            bonus_amount: row.bonus_amount,
            bonus_paid: row.bonus_paid,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

const REFERRAL_SELECT: &str = "SELECT id, referrer_email, code, referred_email, referred_name, status, \
     bonus_amount, bonus_paid, created_at, completed_at FROM referrals";

#[async_trait]
impl ReferralRepository for PgReferralRepository {
    async fn insert(&self, referral: &Referral) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO referrals (id, referrer_email, code, referred_email, referred_name, status,
                bonus_amount, bonus_paid, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(referral.id)
        .bind(&referral.referrer_email)
        .bind(&referral.code)
        .bind(&referral.referred_email)
        .bind(&referral.referred_name)
        .bind(referral.status.as_str())
        .bind(referral.bonus_amount)
        .bind(referral.bonus_paid)
        .bind(referral.created_at)
        .bind(referral.completed_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn find_by_referred(&self, referred_email: &str) -> StoreResult<Option<Referral>> {
        let row = sqlx::query_as::<_, ReferralRow>(&format!("{} WHERE referred_email = $1", REFERRAL_SELECT))
            .bind(referred_email)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        row.map(Referral::try_from).transpose()
    }

    async fn list_by_referrer(&self, referrer_email: &str) -> StoreResult<Vec<Referral>> {
        let rows = sqlx::query_as::<_, ReferralRow>(&format!(
            "{} WHERE referrer_email = $1 ORDER BY created_at DESC",
            REFERRAL_SELECT
        ))
        .bind(referrer_email)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.into_iter().map(Referral::try_from).collect()
    }

    async fn pay_bonus(&self, referral: &Referral, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let claimed = sqlx::query(
            "UPDATE referrals SET bonus_paid = TRUE, status = 'completed', completed_at = $1 WHERE id = $2 AND bonus_paid = FALSE",
        )
        .bind(at)
        .bind(referral.id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(false);
        }

        let credited = sqlx::query(
            "UPDATE customers SET referral_balance = referral_balance + $1, total_earnings = total_earnings + $1 WHERE email = $2",
        )
        .bind(referral.bonus_amount)
        .bind(&referral.referrer_email)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        if credited.rows_affected() == 0 {
            tx.rollback().await.map_err(map_sqlx)?;
            return Err(StoreError::NotFound(format!("customer {}", masked(&referral.referrer_email))));
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(true)
    }
}
