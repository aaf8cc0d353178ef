use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use wrench_shared::Pence;

use crate::models::{Booking, BookingStatus, CustomerAccount, HistoryRecord, PaymentStatus, Referral};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// A unique index rejected the write. Carries the constraint name.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Booking persistence. `insert` must enforce uniqueness of
/// `payment_session_id` when it is present.
#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn insert(&self, booking: &Booking) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<Booking>>;

    async fn find_by_session(&self, session_id: &str) -> StoreResult<Option<Booking>>;

    /// Most recent booking for the same customer, vehicle and primary
    /// service created at or after `since`.
    async fn find_recent_match(
        &self,
        customer_email: &str,
        registration: &str,
        service_label: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<Booking>>;

    async fn list_by_customer(&self, customer_email: &str) -> StoreResult<Vec<Booking>>;

    async fn update_status(
        &self,
        id: Uuid,
        status: BookingStatus,
        payment_status: PaymentStatus,
    ) -> StoreResult<()>;

    /// Flip `ledger_settled` false→true. Returns whether this call won.
    async fn claim_settlement(&self, id: Uuid) -> StoreResult<bool>;

    /// Record `session_id` on a booking created without one. Returns false
    /// when the booking already carries a session; a session recorded on
    /// another booking is a unique violation.
    async fn attach_session(&self, id: Uuid, session_id: &str) -> StoreResult<bool>;
}

/// Per-line history persistence, unique on `history_key`.
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    async fn insert(&self, record: &HistoryRecord) -> StoreResult<()>;

    async fn find_by_key(&self, history_key: &str) -> StoreResult<Option<HistoryRecord>>;

    async fn list_by_booking(&self, booking_id: Uuid) -> StoreResult<Vec<HistoryRecord>>;

    async fn list_by_customer(&self, customer_email: &str) -> StoreResult<Vec<HistoryRecord>>;

    async fn update_status_for_booking(&self, booking_id: Uuid, status: BookingStatus) -> StoreResult<()>;
}

/// Customer accounts and their earnings fields. Balance mutations are
/// single atomic statements; no read-modify-write happens in callers.
#[async_trait]
pub trait CustomerRepository: Send + Sync {
    /// Unique on email and on referral code.
    async fn create(&self, account: &CustomerAccount) -> StoreResult<()>;

    async fn get(&self, email: &str) -> StoreResult<Option<CustomerAccount>>;

    async fn find_by_code(&self, code: &str) -> StoreResult<Option<CustomerAccount>>;

    async fn set_referred_by(&self, email: &str, code: &str) -> StoreResult<()>;

    /// Decrement `total_earnings` by `amount` only if it stays non-negative;
    /// `referral_balance` is decremented with a zero floor. Returns false
    /// when the guard refused the debit (or the account is missing).
    async fn debit_earnings(&self, email: &str, amount: Pence) -> StoreResult<bool>;

    /// Atomically bump `services_booked`, returning the count before the
    /// increment. `None` when no account exists for the email.
    async fn increment_services_booked(&self, email: &str) -> StoreResult<Option<i64>>;
}

#[async_trait]
pub trait ReferralRepository: Send + Sync {
    /// Unique on `referred_email`.
    async fn insert(&self, referral: &Referral) -> StoreResult<()>;

    async fn find_by_referred(&self, referred_email: &str) -> StoreResult<Option<Referral>>;

    async fn list_by_referrer(&self, referrer_email: &str) -> StoreResult<Vec<Referral>>;

    /// Flip `bonus_paid` false→true, mark the referral completed and credit
    /// the referrer's balance and earnings, all or nothing. Returns whether
    /// this call won the flip.
    async fn pay_bonus(&self, referral: &Referral, at: DateTime<Utc>) -> StoreResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    Acquired,
    /// The same session already holds the guard (a retry of itself)
    HeldBySame,
    /// A different session is mid-flight for this customer
    HeldByOther(String),
}

/// Short-lived per-customer marker of an in-flight checkout.
#[async_trait]
pub trait InFlightGuard: Send + Sync {
    async fn try_acquire(&self, customer_key: &str, session_id: &str, ttl_seconds: u64) -> StoreResult<GuardOutcome>;

    /// Release only if still held by `session_id`.
    async fn release(&self, customer_key: &str, session_id: &str) -> StoreResult<()>;
}
