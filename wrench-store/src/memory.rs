//! Process-local implementation of every storage collaborator.
//!
//! Enforces the same unique indexes and conditional updates as the Postgres
//! schema, so the reconciliation engine can be exercised without a
//! database. Fault injection hooks simulate the races and partial failures
//! the engine has to survive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;
use wrench_core::models::{Booking, BookingStatus, CustomerAccount, HistoryRecord, PaymentStatus, Referral, ReferralStatus};
use wrench_core::notify::EventPublisher;
use wrench_core::repository::{
    BookingRepository, CustomerRepository, GuardOutcome, HistoryRepository, InFlightGuard, ReferralRepository,
    StoreResult,
};
use wrench_core::StoreError;
use wrench_shared::Pence;

#[derive(Default)]
struct Tables {
    bookings: HashMap<Uuid, Booking>,
    history: HashMap<Uuid, HistoryRecord>,
    customers: HashMap<String, CustomerAccount>,
    referrals: HashMap<Uuid, Referral>,
    inflight: HashMap<String, String>,
    published: Vec<(String, String)>,
}

#[derive(Default)]
struct Faults {
    stale_session_lookups: u32,
    booking_inserts_unavailable: u32,
    history_inserts_unavailable: u32,
    bonus_payments_unavailable: u32,
    fail_publishing: bool,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
}

fn poisoned() -> StoreError {
    StoreError::Backend("in-memory store lock poisoned".to_string())
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StoreResult<std::sync::MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| poisoned())
    }

    fn take_fault(&self, pick: impl FnOnce(&mut Faults) -> &mut u32) -> bool {
        let mut faults = match self.faults.lock() {
            Ok(f) => f,
            Err(_) => return false,
        };
        let counter = pick(&mut *faults);
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    // Fault injection

    /// The next `n` session lookups report nothing, as if the pre-check ran
    /// before a concurrent writer committed.
    pub fn stale_session_lookups(&self, n: u32) {
        if let Ok(mut f) = self.faults.lock() {
            f.stale_session_lookups = n;
        }
    }

    pub fn fail_booking_inserts(&self, n: u32) {
        if let Ok(mut f) = self.faults.lock() {
            f.booking_inserts_unavailable = n;
        }
    }

    /// Simulates a crash between the booking write and its history rows.
    pub fn fail_history_inserts(&self, n: u32) {
        if let Ok(mut f) = self.faults.lock() {
            f.history_inserts_unavailable = n;
        }
    }

    /// The next `n` bonus payouts fail before anything is written.
    pub fn fail_bonus_payments(&self, n: u32) {
        if let Ok(mut f) = self.faults.lock() {
            f.bonus_payments_unavailable = n;
        }
    }

    pub fn fail_publishing(&self, fail: bool) {
        if let Ok(mut f) = self.faults.lock() {
            f.fail_publishing = fail;
        }
    }

    // Inspection helpers

    pub fn seed_customer(&self, account: CustomerAccount) {
        if let Ok(mut t) = self.tables.lock() {
            t.customers.insert(account.email.clone(), account);
        }
    }

    pub fn customer(&self, email: &str) -> Option<CustomerAccount> {
        self.tables.lock().ok()?.customers.get(email).cloned()
    }

    pub fn booking_count(&self) -> usize {
        self.tables.lock().map(|t| t.bookings.len()).unwrap_or(0)
    }

    pub fn history_count(&self) -> usize {
        self.tables.lock().map(|t| t.history.len()).unwrap_or(0)
    }

    pub fn referral_for(&self, referred_email: &str) -> Option<Referral> {
        self.tables
            .lock()
            .ok()?
            .referrals
            .values()
            .find(|r| r.referred_email == referred_email)
            .cloned()
    }

    /// Backdate a booking, e.g. to push it past the settlement grace period
    pub fn backdate_booking(&self, id: Uuid, created_at: DateTime<Utc>) {
        if let Ok(mut t) = self.tables.lock() {
            if let Some(b) = t.bookings.get_mut(&id) {
                b.created_at = created_at;
            }
        }
    }

    pub fn published(&self, topic: &str) -> Vec<String> {
        self.tables
            .lock()
            .map(|t| {
                t.published
                    .iter()
                    .filter(|(tp, _)| tp == topic)
                    .map(|(_, payload)| payload.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl BookingRepository for InMemoryStore {
    async fn insert(&self, booking: &Booking) -> StoreResult<()> {
        if self.take_fault(|f| &mut f.booking_inserts_unavailable) {
            return Err(StoreError::Unavailable("injected booking write failure".to_string()));
        }
        let mut t = self.tables()?;
        if let Some(session) = &booking.payment_session_id {
            if t.bookings.values().any(|b| b.payment_session_id.as_ref() == Some(session)) {
                return Err(StoreError::UniqueViolation("bookings_payment_session_id_key".to_string()));
            }
        }
        if t.bookings.contains_key(&booking.id) {
            return Err(StoreError::UniqueViolation("bookings_pkey".to_string()));
        }
        t.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Booking>> {
        Ok(self.tables()?.bookings.get(&id).cloned())
    }

    async fn find_by_session(&self, session_id: &str) -> StoreResult<Option<Booking>> {
        if self.take_fault(|f| &mut f.stale_session_lookups) {
            return Ok(None);
        }
        Ok(self
            .tables()?
            .bookings
            .values()
            .find(|b| b.payment_session_id.as_deref() == Some(session_id))
            .cloned())
    }

    async fn find_recent_match(
        &self,
        customer_email: &str,
        registration: &str,
        service_label: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<Booking>> {
        Ok(self
            .tables()?
            .bookings
            .values()
            .filter(|b| {
                b.customer.email == customer_email
                    && b.vehicle.registration == registration
                    && b.primary_label() == Some(service_label)
                    && b.created_at >= since
                    && b.status != BookingStatus::Cancelled
            })
            .max_by_key(|b| b.created_at)
            .cloned())
    }

    async fn list_by_customer(&self, customer_email: &str) -> StoreResult<Vec<Booking>> {
        let mut bookings: Vec<Booking> = self
            .tables()?
            .bookings
            .values()
            .filter(|b| b.customer.email == customer_email)
            .cloned()
            .collect();
        bookings.sort_by(|a, b| b.scheduled_date.cmp(&a.scheduled_date).then(b.created_at.cmp(&a.created_at)));
        Ok(bookings)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: BookingStatus,
        payment_status: PaymentStatus,
    ) -> StoreResult<()> {
        let mut t = self.tables()?;
        let booking = t
            .bookings
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("booking {}", id)))?;
        booking.status = status;
        booking.payment_status = payment_status;
        booking.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_settlement(&self, id: Uuid) -> StoreResult<bool> {
        let mut t = self.tables()?;
        match t.bookings.get_mut(&id) {
            Some(b) if !b.ledger_settled => {
                b.ledger_settled = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn attach_session(&self, id: Uuid, session_id: &str) -> StoreResult<bool> {
        let mut t = self.tables()?;
        if t
            .bookings
            .values()
            .any(|b| b.id != id && b.payment_session_id.as_deref() == Some(session_id))
        {
            return Err(StoreError::UniqueViolation("bookings_payment_session_id_key".to_string()));
        }
        match t.bookings.get_mut(&id) {
            Some(b) if b.payment_session_id.is_none() => {
                b.payment_session_id = Some(session_id.to_string());
                b.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl HistoryRepository for InMemoryStore {
    async fn insert(&self, record: &HistoryRecord) -> StoreResult<()> {
        if self.take_fault(|f| &mut f.history_inserts_unavailable) {
            return Err(StoreError::Unavailable("injected history write failure".to_string()));
        }
        let mut t = self.tables()?;
        if t.history.values().any(|h| h.history_key == record.history_key) {
            return Err(StoreError::UniqueViolation("service_history_key".to_string()));
        }
        t.history.insert(record.id, record.clone());
        Ok(())
    }

    async fn find_by_key(&self, history_key: &str) -> StoreResult<Option<HistoryRecord>> {
        Ok(self.tables()?.history.values().find(|h| h.history_key == history_key).cloned())
    }

    async fn list_by_booking(&self, booking_id: Uuid) -> StoreResult<Vec<HistoryRecord>> {
        let mut rows: Vec<HistoryRecord> = self
            .tables()?
            .history
            .values()
            .filter(|h| h.booking_id == booking_id)
            .cloned()
            .collect();
        rows.sort_by_key(|h| h.created_at);
        Ok(rows)
    }

    async fn list_by_customer(&self, customer_email: &str) -> StoreResult<Vec<HistoryRecord>> {
        let mut rows: Vec<HistoryRecord> = self
            .tables()?
            .history
            .values()
            .filter(|h| h.customer_email == customer_email)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.service_date.cmp(&a.service_date));
        Ok(rows)
    }

    async fn update_status_for_booking(&self, booking_id: Uuid, status: BookingStatus) -> StoreResult<()> {
        let mut t = self.tables()?;
        for h in t.history.values_mut().filter(|h| h.booking_id == booking_id) {
            h.status = status;
            h.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl CustomerRepository for InMemoryStore {
    async fn create(&self, account: &CustomerAccount) -> StoreResult<()> {
        let mut t = self.tables()?;
        if t.customers.contains_key(&account.email) {
            return Err(StoreError::UniqueViolation("customers_pkey".to_string()));
        }
        if t.customers.values().any(|c| c.referral_code == account.referral_code) {
            return Err(StoreError::UniqueViolation("customers_referral_code_key".to_string()));
        }
        t.customers.insert(account.email.clone(), account.clone());
        Ok(())
    }

    async fn get(&self, email: &str) -> StoreResult<Option<CustomerAccount>> {
        Ok(self.tables()?.customers.get(email).cloned())
    }

    async fn find_by_code(&self, code: &str) -> StoreResult<Option<CustomerAccount>> {
        Ok(self.tables()?.customers.values().find(|c| c.referral_code == code).cloned())
    }

    async fn set_referred_by(&self, email: &str, code: &str) -> StoreResult<()> {
        let mut t = self.tables()?;
        if let Some(c) = t.customers.get_mut(email) {
            if c.referred_by.is_none() {
                c.referred_by = Some(code.to_string());
            }
        }
        Ok(())
    }

    async fn debit_earnings(&self, email: &str, amount: Pence) -> StoreResult<bool> {
        let mut t = self.tables()?;
        match t.customers.get_mut(email) {
            Some(c) if c.total_earnings >= amount => {
                c.total_earnings -= amount;
                c.referral_balance = (c.referral_balance - amount).max(0);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_services_booked(&self, email: &str) -> StoreResult<Option<i64>> {
        let mut t = self.tables()?;
        Ok(t.customers.get_mut(email).map(|c| {
            let previous = c.services_booked;
            c.services_booked += 1;
            previous
        }))
    }
}

#[async_trait]
impl ReferralRepository for InMemoryStore {
    async fn insert(&self, referral: &Referral) -> StoreResult<()> {
        let mut t = self.tables()?;
        if t.referrals.values().any(|r| r.referred_email == referral.referred_email) {
            return Err(StoreError::UniqueViolation("referrals_referred_email_key".to_string()));
        }
        t.referrals.insert(referral.id, referral.clone());
        Ok(())
    }

    async fn find_by_referred(&self, referred_email: &str) -> StoreResult<Option<Referral>> {
        Ok(self.tables()?.referrals.values().find(|r| r.referred_email == referred_email).cloned())
    }

    async fn list_by_referrer(&self, referrer_email: &str) -> StoreResult<Vec<Referral>> {
        let mut rows: Vec<Referral> = self
            .tables()?
            .referrals
            .values()
            .filter(|r| r.referrer_email == referrer_email)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn pay_bonus(&self, referral: &Referral, at: DateTime<Utc>) -> StoreResult<bool> {
        if self.take_fault(|f| &mut f.bonus_payments_unavailable) {
            return Err(StoreError::Unavailable("injected bonus payment failure".to_string()));
        }
        let mut t = self.tables()?;
        match t.referrals.get(&referral.id) {
            Some(r) if !r.bonus_paid => {}
            _ => return Ok(false),
        }
        // Referrer first: a missing account leaves the referral unpaid
        let referrer = t
            .customers
            .get_mut(&referral.referrer_email)
            .ok_or_else(|| StoreError::NotFound(format!("customer {}", referral.referrer_email)))?;
        referrer.referral_balance += referral.bonus_amount;
        referrer.total_earnings += referral.bonus_amount;

        if let Some(r) = t.referrals.get_mut(&referral.id) {
            r.bonus_paid = true;
            r.status = ReferralStatus::Completed;
            r.completed_at = Some(at);
        }
        Ok(true)
    }
}

#[async_trait]
impl InFlightGuard for InMemoryStore {
    // TTL is not modelled; tests release explicitly
    async fn try_acquire(&self, customer_key: &str, session_id: &str, _ttl_seconds: u64) -> StoreResult<GuardOutcome> {
        let mut t = self.tables()?;
        match t.inflight.get(customer_key) {
            Some(holder) if holder == session_id => Ok(GuardOutcome::HeldBySame),
            Some(holder) => Ok(GuardOutcome::HeldByOther(holder.clone())),
            None => {
                t.inflight.insert(customer_key.to_string(), session_id.to_string());
                Ok(GuardOutcome::Acquired)
            }
        }
    }

    async fn release(&self, customer_key: &str, session_id: &str) -> StoreResult<()> {
        let mut t = self.tables()?;
        if t.inflight.get(customer_key).map(String::as_str) == Some(session_id) {
            t.inflight.remove(customer_key);
        }
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for InMemoryStore {
    async fn publish(&self, topic: &str, _key: &str, payload: &str) -> StoreResult<()> {
        let failing = self.faults.lock().map(|f| f.fail_publishing).unwrap_or(false);
        if failing {
            return Err(StoreError::Unavailable("injected publish failure".to_string()));
        }
        self.tables()?.published.push((topic.to_string(), payload.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(email: &str, code: &str) -> CustomerAccount {
        CustomerAccount::new(email.to_string(), "Test".to_string(), None, code.to_string())
    }

    #[tokio::test]
    async fn test_debit_refuses_to_go_negative() {
        let store = InMemoryStore::new();
        let mut alice = account("alice@example.com", "WRAAAAAA");
        alice.total_earnings = 500;
        alice.referral_balance = 200;
        store.seed_customer(alice);

        assert!(!store.debit_earnings("alice@example.com", 600).await.unwrap());
        assert!(store.debit_earnings("alice@example.com", 500).await.unwrap());

        let alice = store.customer("alice@example.com").unwrap();
        assert_eq!(alice.total_earnings, 0);
        assert_eq!(alice.referral_balance, 0);
    }

    #[tokio::test]
    async fn test_referral_code_is_unique() {
        let store = InMemoryStore::new();
        CustomerRepository::create(&store, &account("a@example.com", "WRCODE01")).await.unwrap();
        let err = CustomerRepository::create(&store, &account("b@example.com", "WRCODE01")).await.unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn test_inflight_guard_distinguishes_holders() {
        let store = InMemoryStore::new();
        assert_eq!(store.try_acquire("carol", "sess_a", 30).await.unwrap(), GuardOutcome::Acquired);
        assert_eq!(store.try_acquire("carol", "sess_a", 30).await.unwrap(), GuardOutcome::HeldBySame);
        assert_eq!(
            store.try_acquire("carol", "sess_b", 30).await.unwrap(),
            GuardOutcome::HeldByOther("sess_a".to_string())
        );

        // Only the holder can release
        store.release("carol", "sess_b").await.unwrap();
        assert!(matches!(store.try_acquire("carol", "sess_b", 30).await.unwrap(), GuardOutcome::HeldByOther(_)));
        store.release("carol", "sess_a").await.unwrap();
        assert_eq!(store.try_acquire("carol", "sess_b", 30).await.unwrap(), GuardOutcome::Acquired);
    }
}
