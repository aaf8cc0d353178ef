use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wrench_core::models::{history_key, Booking, BookingStatus, BookingTotals, HistoryRecord, PaymentStatus};
use wrench_core::notify::{EventPublisher, Notifier};
use wrench_core::repository::{BookingRepository, GuardOutcome, HistoryRepository, InFlightGuard};
use wrench_core::settings::ReconciliationSettings;
use wrench_core::{CoreError, CoreResult, StoreError};
use wrench_referral::{BonusOutcome, ReferralError, ReferralLedger};
use wrench_shared::models::events::BookingConfirmedEvent;
use wrench_shared::money::format_pounds;
use wrench_shared::pii::masked;
use wrench_shared::Pence;

use crate::intent::ReconciliationIntent;

pub const CONFIRMATION_TEMPLATE: &str = "booking-confirmation";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub booking_id: Uuid,
    pub history_ids: Vec<Uuid>,
    pub is_duplicate: bool,
    pub earnings_applied: Pence,
    pub amount_charged: Pence,
    /// Non-fatal problems: notification or ledger anomalies
    pub warnings: Vec<String>,
}

/// Everything the engine talks to besides the referral ledger
#[derive(Clone)]
pub struct Collaborators {
    pub bookings: Arc<dyn BookingRepository>,
    pub history: Arc<dyn HistoryRepository>,
    pub guard: Arc<dyn InFlightGuard>,
    pub notifier: Arc<dyn Notifier>,
    pub events: Arc<dyn EventPublisher>,
    pub booking_topic: String,
}

/// Turns payment confirmations into exactly one booking, one history row
/// per service line and at most one ledger settlement, whichever trigger
/// delivers them and however often.
///
/// The unique index on the payment session id is the only serialization
/// point. A lost insert race is resolved by reading the winner's booking.
pub struct Reconciler {
    bookings: Arc<dyn BookingRepository>,
    history: Arc<dyn HistoryRepository>,
    guard: Arc<dyn InFlightGuard>,
    notifier: Arc<dyn Notifier>,
    events: Arc<dyn EventPublisher>,
    booking_topic: String,
    ledger: Arc<ReferralLedger>,
    settings: ReconciliationSettings,
}

impl Reconciler {
    pub fn new(collaborators: Collaborators, ledger: Arc<ReferralLedger>, settings: ReconciliationSettings) -> Self {
        Self {
            bookings: collaborators.bookings,
            history: collaborators.history,
            guard: collaborators.guard,
            notifier: collaborators.notifier,
            events: collaborators.events,
            booking_topic: collaborators.booking_topic,
            ledger,
            settings,
        }
    }

    pub fn settings(&self) -> &ReconciliationSettings {
        &self.settings
    }

    pub async fn reconcile(&self, intent: ReconciliationIntent) -> CoreResult<ReconcileOutcome> {
        intent.validate()?;
        let email = intent.customer.email.clone();

        // (a) exact session match
        if let Some(session) = intent.payment_session_id.as_deref() {
            if let Some(existing) = self.bookings.find_by_session(session).await? {
                debug!("Session {} already reconciled as booking {}", session, existing.id);
                return self.resolve_duplicate(existing).await;
            }
        }

        // (b) client double-submit of the same booking
        if let Some(label) = intent.primary_label() {
            let since = Utc::now() - Duration::seconds(self.settings.double_submit_window_secs);
            if let Some(mut existing) = self
                .bookings
                .find_recent_match(&email, &intent.vehicle.registration, label, since)
                .await?
            {
                let existing_session = existing.payment_session_id.clone();
                match (existing_session.as_deref(), intent.payment_session_id.as_deref()) {
                    // Two different paid sessions are two real bookings
                    (Some(a), Some(b)) if a != b => {}
                    // The session must land on the booking or redelivery misses it at (a)
                    (None, Some(session)) => match self.bookings.attach_session(existing.id, session).await {
                        Ok(true) => {
                            info!(
                                "Session {} attached to booking {} created moments earlier for {}",
                                session,
                                existing.id,
                                masked(&email)
                            );
                            existing.payment_session_id = Some(session.to_string());
                            return self.resolve_duplicate(existing).await;
                        }
                        Ok(false) | Err(StoreError::UniqueViolation(_)) => {
                            if let Some(owner) = self.bookings.find_by_session(session).await? {
                                return self.resolve_duplicate(owner).await;
                            }
                        }
                        Err(e) => return Err(e.into()),
                    },
                    _ => {
                        info!(
                            "Double submit for {} collapsed onto booking {}",
                            masked(&email),
                            existing.id
                        );
                        return self.resolve_duplicate(existing).await;
                    }
                }
            }
        }

        // (c) backpressure while another session for this customer is in flight
        let token = intent
            .payment_session_id
            .clone()
            .unwrap_or_else(|| format!("direct:{}", Uuid::new_v4()));
        let acquired = match self.guard.try_acquire(&email, &token, self.settings.inflight_ttl_secs).await {
            Ok(GuardOutcome::Acquired) => true,
            Ok(GuardOutcome::HeldBySame) => false,
            Ok(GuardOutcome::HeldByOther(other)) => {
                info!(
                    "Checkout {} for {} waits on in-flight {}",
                    token,
                    masked(&email),
                    other
                );
                return Err(CoreError::Conflict(
                    "another checkout for this customer is in progress, retry shortly".to_string(),
                ));
            }
            Err(e) => {
                // The unique index still protects the write
                warn!("In-flight guard unavailable, continuing without it: {}", e);
                false
            }
        };

        let result = self.write_new(intent).await;

        if acquired {
            if let Err(e) = self.guard.release(&email, &token).await {
                warn!("Failed to release in-flight guard for {}: {}", masked(&email), e);
            }
        }
        result
    }

    async fn write_new(&self, intent: ReconciliationIntent) -> CoreResult<ReconcileOutcome> {
        let email = intent.customer.email.clone();
        let available = self.ledger.available_earnings(&email).await?;
        let booking = build_booking(&intent, available);

        if let Some(captured) = booking.totals.amount_captured {
            if captured != booking.totals.total {
                warn!(
                    "Gateway captured {} but booking {} charges {}",
                    format_pounds(captured),
                    booking.id,
                    format_pounds(booking.totals.total)
                );
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.bookings.insert(&booking).await {
                Ok(()) => break,
                Err(StoreError::UniqueViolation(constraint)) => {
                    // Lost the race; the winner's booking is authoritative
                    if let Some(session) = intent.payment_session_id.as_deref() {
                        if let Some(existing) = self.bookings.find_by_session(session).await? {
                            info!(
                                "Session {} won by a concurrent writer ({}), resolving to booking {}",
                                session, constraint, existing.id
                            );
                            return self.resolve_duplicate(existing).await;
                        }
                    }
                    warn!("Unresolved unique violation on {} (attempt {})", constraint, attempt);
                }
                Err(e) if e.is_transient() => {
                    warn!("Booking write failed (attempt {}): {}", attempt, e);
                }
                Err(e) => return Err(e.into()),
            }

            if attempt >= self.settings.max_write_attempts {
                return Err(CoreError::Conflict(format!(
                    "booking could not be written after {} attempts",
                    attempt
                )));
            }
            self.backoff(attempt).await;
        }

        info!(
            "Booking {} created for {} via {}: nominal {}, earnings applied {}, charged {}",
            booking.id,
            masked(&email),
            intent.source.as_str(),
            format_pounds(booking.totals.nominal_total),
            format_pounds(booking.totals.earnings_applied),
            format_pounds(booking.totals.total)
        );

        // History rows are keyed independently, so a failure here is healed
        // by the next delivery of the same session.
        let history = self.ensure_history(&booking).await;

        let mut warnings = self.settle(&booking).await;

        let history_ids = match history {
            Ok(ids) => ids,
            Err(e) => {
                error!("Booking {} saved but history incomplete: {}", booking.id, e);
                return Err(e);
            }
        };

        self.publish_confirmed(&booking, &mut warnings).await;
        self.notify(&booking, &mut warnings).await;

        Ok(ReconcileOutcome {
            booking_id: booking.id,
            history_ids,
            is_duplicate: false,
            earnings_applied: booking.totals.earnings_applied,
            amount_charged: booking.totals.total,
            warnings,
        })
    }

    /// Short-circuit to an existing booking, filling in any missing history
    /// rows and recovering an abandoned settlement.
    async fn resolve_duplicate(&self, existing: Booking) -> CoreResult<ReconcileOutcome> {
        let history_ids = self.ensure_history(&existing).await?;

        let mut warnings = Vec::new();
        let grace = Duration::seconds(self.settings.settlement_grace_secs);
        if !existing.ledger_settled && Utc::now() - existing.created_at >= grace {
            warn!(
                "Booking {} was never settled; settling on redelivery",
                existing.id
            );
            warnings = self.settle(&existing).await;
        }

        Ok(ReconcileOutcome {
            booking_id: existing.id,
            history_ids,
            is_duplicate: true,
            earnings_applied: existing.totals.earnings_applied,
            amount_charged: existing.totals.total,
            warnings,
        })
    }

    /// Make sure every service line of `booking` has its history row.
    async fn ensure_history(&self, booking: &Booking) -> CoreResult<Vec<Uuid>> {
        let existing = self.history.list_by_booking(booking.id).await?;
        let mut ids = Vec::with_capacity(booking.services.len());

        for record in history_records(booking) {
            // Rows written before a session was attached keep their original key
            let found = existing
                .iter()
                .find(|h| h.history_key == record.history_key || h.service.line_id == record.service.line_id);
            match found {
                Some(found) => ids.push(found.id),
                None => ids.push(self.put_history(&record).await?),
            }
        }
        Ok(ids)
    }

    async fn put_history(&self, record: &HistoryRecord) -> CoreResult<Uuid> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.history.insert(record).await {
                Ok(()) => return Ok(record.id),
                Err(StoreError::UniqueViolation(_)) => {
                    if let Some(found) = self.history.find_by_key(&record.history_key).await? {
                        return Ok(found.id);
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!("History write for {} failed (attempt {}): {}", record.history_key, attempt, e);
                }
                Err(e) => return Err(e.into()),
            }

            if attempt >= self.settings.max_write_attempts {
                return Err(CoreError::TransientStorage(format!(
                    "history row {} not written after {} attempts",
                    record.history_key, attempt
                )));
            }
            self.backoff(attempt).await;
        }
    }

    /// Apply the booking's ledger effects if this call wins the settlement
    /// claim. Failures become warnings; nothing here fails the booking.
    async fn settle(&self, booking: &Booking) -> Vec<String> {
        let mut warnings = Vec::new();
        let email = booking.customer.email.as_str();

        match self.bookings.claim_settlement(booking.id).await {
            Ok(true) => {}
            Ok(false) => return warnings,
            Err(e) => {
                warn!("Could not claim settlement of booking {}: {}", booking.id, e);
                warnings.push("referral ledger not yet updated".to_string());
                return warnings;
            }
        }

        let applied = booking.totals.earnings_applied;
        if applied > 0 {
            match self.ledger.settle_discount(email, applied).await {
                Ok(()) => info!("Debited {} of earnings from {}", format_pounds(applied), masked(email)),
                Err(ReferralError::LedgerInvariant(msg)) => {
                    warnings.push(format!("earnings not debited: {}", msg));
                }
                Err(e) => {
                    error!(
                        "Debit of {} for booking {} failed after settlement claim: {}",
                        format_pounds(applied),
                        booking.id,
                        e
                    );
                    warnings.push("earnings debit failed".to_string());
                }
            }
        }

        match self.ledger.record_booking(email).await {
            Ok(Some(0)) => match self.award_bonus(email).await {
                Ok(outcome) if outcome.applied => {
                    debug!("First booking of {} paid a referral bonus", masked(email));
                }
                Ok(_) => {}
                Err(e) => warnings.push(format!("referral bonus not paid: {}", e)),
            },
            Ok(_) => {}
            Err(e) => {
                error!("Failed to count booking {} for {}: {}", booking.id, masked(email), e);
                warnings.push("services booked count not updated".to_string());
            }
        }

        warnings
    }

    async fn award_bonus(&self, email: &str) -> Result<BonusOutcome, ReferralError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.ledger.award_bonus(email).await {
                Err(ReferralError::Store(e)) if e.is_transient() && attempt < self.settings.max_write_attempts => {
                    warn!("Referral bonus for {} failed (attempt {}): {}", masked(email), attempt, e);
                    self.backoff(attempt).await;
                }
                outcome => return outcome,
            }
        }
    }

    async fn publish_confirmed(&self, booking: &Booking, warnings: &mut Vec<String>) {
        let event = BookingConfirmedEvent {
            booking_id: booking.id,
            payment_session_id: booking.payment_session_id.clone(),
            customer_email: booking.customer.email.clone(),
            amount_charged: booking.totals.total,
            earnings_applied: booking.totals.earnings_applied,
            timestamp: Utc::now().timestamp(),
        };
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize booking event: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .events
            .publish(&self.booking_topic, &booking.id.to_string(), &payload)
            .await
        {
            warn!("Failed to publish {} for booking {}: {}", self.booking_topic, booking.id, e);
            warnings.push("booking event not published".to_string());
        }
    }

    async fn notify(&self, booking: &Booking, warnings: &mut Vec<String>) {
        let data = json!({
            "bookingId": booking.id,
            "customerName": booking.customer.name,
            "vehicle": {
                "make": booking.vehicle.make,
                "model": booking.vehicle.model,
                "registration": booking.vehicle.registration,
            },
            "services": booking.services.iter().map(|s| s.label.as_str()).collect::<Vec<_>>(),
            "date": booking.scheduled_date.format("%Y-%m-%d").to_string(),
            "time": booking.scheduled_time.format("%H:%M").to_string(),
            "total": format_pounds(booking.totals.total),
            "earningsApplied": format_pounds(booking.totals.earnings_applied),
        });

        if !self
            .notifier
            .send(&booking.customer.email, CONFIRMATION_TEMPLATE, &data)
            .await
        {
            warn!("Confirmation for booking {} was not sent", booking.id);
            warnings.push("confirmation email not sent".to_string());
        }
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self.settings.retry_backoff_ms.saturating_mul(attempt as u64);
        tokio::time::sleep(StdDuration::from_millis(delay)).await;
    }
}

fn build_booking(intent: &ReconciliationIntent, available_earnings: Pence) -> Booking {
    let nominal = intent.nominal_total();
    let applied = available_earnings.clamp(0, nominal.max(0));
    let now = Utc::now();

    Booking {
        id: Uuid::new_v4(),
        payment_session_id: intent.payment_session_id.clone(),
        customer: intent.customer.clone(),
        vehicle: intent.vehicle.clone(),
        services: intent.services.clone(),
        totals: BookingTotals {
            subtotal: intent.subtotal(),
            labour_cost: intent.services.iter().map(|s| s.labour_cost).sum(),
            parts_cost: intent.services.iter().map(|s| s.parts_cost).sum(),
            vat: intent.vat,
            nominal_total: nominal,
            earnings_applied: applied,
            total: (nominal - applied).max(0),
            amount_captured: intent.amount_captured,
        },
        status: BookingStatus::Confirmed,
        payment_status: PaymentStatus::Paid,
        scheduled_date: intent.scheduled_date,
        scheduled_time: intent.scheduled_time,
        source: intent.source,
        ledger_settled: false,
        created_at: now,
        updated_at: now,
    }
}

/// One history row per service line. The discount is spread over the
/// lines in proportion to their price.
fn history_records(booking: &Booking) -> Vec<HistoryRecord> {
    let prices: Vec<Pence> = booking.services.iter().map(|s| s.price).collect();
    let shares = apportion(booking.totals.earnings_applied.min(booking.totals.subtotal), &prices);

    booking
        .services
        .iter()
        .zip(shares)
        .enumerate()
        .map(|(index, (line, share))| HistoryRecord {
            id: Uuid::new_v4(),
            history_key: history_key(booking.payment_session_id.as_deref(), booking.id, index, &line.line_id),
            booking_id: booking.id,
            payment_session_id: booking.payment_session_id.clone(),
            customer_email: booking.customer.email.clone(),
            vehicle: booking.vehicle.clone(),
            service: line.clone(),
            earnings_applied: share,
            amount_charged: (line.price - share).max(0),
            status: booking.status,
            service_date: booking.scheduled_date,
            created_at: booking.created_at,
            updated_at: booking.created_at,
        })
        .collect()
}

/// Split `amount` across `weights`; rounding remainder goes to the first
fn apportion(amount: Pence, weights: &[Pence]) -> Vec<Pence> {
    let total: Pence = weights.iter().sum();
    if weights.is_empty() {
        return Vec::new();
    }
    if total <= 0 {
        let mut shares = vec![0; weights.len()];
        shares[0] = amount;
        return shares;
    }
    let mut shares: Vec<Pence> = weights
        .iter()
        .map(|w| ((amount as i128 * *w as i128) / total as i128) as Pence)
        .collect();
    let allocated: Pence = shares.iter().sum();
    shares[0] += amount - allocated;
    shares
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use wrench_core::models::{
        CustomerAccount, CustomerSnapshot, ReferralStatus, ServiceLine, TriggerSource, VehicleSnapshot,
    };
    use wrench_core::repository::CustomerRepository;
    use wrench_core::settings::ReferralSettings;
    use wrench_referral::Registration;
    use wrench_store::InMemoryStore;

    struct FlakyNotifier {
        deliver: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Notifier for FlakyNotifier {
        async fn send(&self, _recipient: &str, _template: &str, _data: &Value) -> bool {
            self.deliver.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        notifier: Arc<FlakyNotifier>,
        ledger: Arc<ReferralLedger>,
        engine: Reconciler,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let notifier = Arc::new(FlakyNotifier { deliver: AtomicBool::new(true) });
        let ledger = Arc::new(ReferralLedger::new(store.clone(), store.clone(), ReferralSettings::default()));
        let settings = ReconciliationSettings {
            retry_backoff_ms: 1,
            ..Default::default()
        };
        let engine = Reconciler::new(
            Collaborators {
                bookings: store.clone(),
                history: store.clone(),
                guard: store.clone(),
                notifier: notifier.clone(),
                events: store.clone(),
                booking_topic: "booking.confirmed".to_string(),
            },
            ledger.clone(),
            settings,
        );
        Harness { store, notifier, ledger, engine }
    }

    fn seed(store: &InMemoryStore, email: &str, earnings: Pence) {
        let mut account = CustomerAccount::new(email.to_string(), "Test".to_string(), None, format!("WR{:06}", earnings));
        account.total_earnings = earnings;
        account.referral_balance = earnings;
        store.seed_customer(account);
    }

    fn line(id: &str, label: &str, price: Pence) -> ServiceLine {
        ServiceLine {
            line_id: id.to_string(),
            label: label.to_string(),
            price,
            labour_hours: 1.0,
            labour_cost: price / 2,
            parts_cost: price / 2,
        }
    }

    fn intent(session: Option<&str>, email: &str, services: Vec<ServiceLine>) -> ReconciliationIntent {
        ReconciliationIntent {
            source: TriggerSource::Webhook,
            payment_session_id: session.map(String::from),
            customer: CustomerSnapshot {
                name: "Alice".to_string(),
                email: email.to_string(),
                phone: None,
            },
            vehicle: VehicleSnapshot {
                make: "Ford".to_string(),
                model: "Focus".to_string(),
                year: Some(2018),
                registration: "AB12CDE".to_string(),
            },
            services,
            vat: 0,
            scheduled_date: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
            scheduled_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            amount_captured: None,
        }
    }

    fn alice_sess_1() -> ReconciliationIntent {
        intent(Some("sess_1"), "alice@example.com", vec![line("l0", "Full Service", 10000)])
    }

    #[tokio::test]
    async fn test_earnings_discount_applied_and_settled() {
        let h = harness();
        seed(&h.store, "alice@example.com", 2000);

        let outcome = h.engine.reconcile(alice_sess_1()).await.unwrap();

        assert!(!outcome.is_duplicate);
        assert_eq!(outcome.amount_charged, 8000);
        assert_eq!(outcome.earnings_applied, 2000);
        assert_eq!(outcome.history_ids.len(), 1);
        assert!(outcome.warnings.is_empty());

        let alice = h.store.customer("alice@example.com").unwrap();
        assert_eq!(alice.total_earnings, 0);
        assert_eq!(alice.services_booked, 1);

        let booking = h.store.find_by_session("sess_1").await.unwrap().unwrap();
        assert_eq!(booking.totals.nominal_total, 10000);
        assert_eq!(booking.totals.total, 8000);
        assert!(booking.ledger_settled);
        assert_eq!(h.store.published("booking.confirmed").len(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_is_duplicate_with_same_booking() {
        let h = harness();
        seed(&h.store, "alice@example.com", 2000);

        let first = h.engine.reconcile(alice_sess_1()).await.unwrap();
        let mut again = alice_sess_1();
        again.source = TriggerSource::SessionConfirm;
        let second = h.engine.reconcile(again).await.unwrap();

        assert!(second.is_duplicate);
        assert_eq!(second.booking_id, first.booking_id);
        assert_eq!(second.history_ids, first.history_ids);
        assert_eq!(second.amount_charged, 8000);
        assert_eq!(h.store.booking_count(), 1);
        assert_eq!(h.store.history_count(), 1);

        let alice = h.store.customer("alice@example.com").unwrap();
        assert_eq!(alice.total_earnings, 0);
        assert_eq!(alice.services_booked, 1);
    }

    #[tokio::test]
    async fn test_discount_never_exceeds_nominal_total() {
        let h = harness();
        seed(&h.store, "alice@example.com", 15000);

        let outcome = h.engine.reconcile(alice_sess_1()).await.unwrap();

        assert_eq!(outcome.amount_charged, 0);
        assert_eq!(outcome.earnings_applied, 10000);
        assert_eq!(h.store.customer("alice@example.com").unwrap().total_earnings, 5000);
    }

    #[tokio::test]
    async fn test_lost_insert_race_resolves_to_winner() {
        let h = harness();
        let first = h.engine.reconcile(alice_sess_1()).await.unwrap();

        // The pre-check misses the committed booking; the unique index catches it
        h.store.stale_session_lookups(1);
        let second = h.engine.reconcile(alice_sess_1()).await.unwrap();

        assert!(second.is_duplicate);
        assert_eq!(second.booking_id, first.booking_id);
        assert_eq!(h.store.booking_count(), 1);
        assert!(h.store.customer("alice@example.com").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_triggers_write_one_booking() {
        let h = Arc::new(harness());
        seed(&h.store, "alice@example.com", 2000);

        let mut tasks = Vec::new();
        for source in [TriggerSource::Webhook, TriggerSource::SessionConfirm, TriggerSource::DirectCreate] {
            let h = h.clone();
            tasks.push(tokio::spawn(async move {
                let mut i = alice_sess_1();
                i.source = source;
                h.engine.reconcile(i).await
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(outcome) => ids.push(outcome.booking_id),
                Err(e) => assert!(e.is_retryable(), "unexpected error {}", e),
            }
        }

        assert!(!ids.is_empty());
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(h.store.booking_count(), 1);
        assert_eq!(h.store.customer("alice@example.com").unwrap().total_earnings, 0);
    }

    #[tokio::test]
    async fn test_multi_line_checkout_writes_row_per_line() {
        let h = harness();
        seed(&h.store, "alice@example.com", 3000);
        let checkout = intent(
            Some("sess_multi"),
            "alice@example.com",
            vec![line("oil", "Oil Change", 5000), line("mot", "MOT", 5000)],
        );

        let outcome = h.engine.reconcile(checkout.clone()).await.unwrap();
        assert_eq!(outcome.history_ids.len(), 2);
        h.engine.reconcile(checkout).await.unwrap();

        let rows = h.store.list_by_booking(outcome.booking_id).await.unwrap();
        let mut keys: Vec<&str> = rows.iter().map(|r| r.history_key.as_str()).collect();
        keys.sort();
        assert_eq!(keys, vec!["sess_multi", "sess_multi:mot"]);
        assert_eq!(rows.iter().map(|r| r.earnings_applied).sum::<Pence>(), 3000);
        assert_eq!(rows.iter().map(|r| r.amount_charged).sum::<Pence>(), 7000);
    }

    #[tokio::test]
    async fn test_missing_history_filled_on_redelivery() {
        let h = harness();
        h.store.fail_history_inserts(3);

        let err = h.engine.reconcile(alice_sess_1()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.store.booking_count(), 1);
        assert_eq!(h.store.history_count(), 0);

        let outcome = h.engine.reconcile(alice_sess_1()).await.unwrap();
        assert!(outcome.is_duplicate);
        assert_eq!(outcome.history_ids.len(), 1);
        assert_eq!(h.store.history_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_booking_failure_retried() {
        let h = harness();
        h.store.fail_booking_inserts(2);

        let outcome = h.engine.reconcile(alice_sess_1()).await.unwrap();
        assert!(!outcome.is_duplicate);
        assert_eq!(h.store.booking_count(), 1);
    }

    #[tokio::test]
    async fn test_write_attempts_exhausted_is_retryable_conflict() {
        let h = harness();
        h.store.fail_booking_inserts(10);

        let err = h.engine.reconcile(alice_sess_1()).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert!(err.is_retryable());
        assert_eq!(h.store.booking_count(), 0);
    }

    #[tokio::test]
    async fn test_unsettled_booking_recovered_after_grace() {
        let h = harness();
        seed(&h.store, "alice@example.com", 2000);

        // A writer that died after the insert
        let booking = build_booking(&alice_sess_1(), 2000);
        BookingRepository::insert(&*h.store, &booking).await.unwrap();

        // Too young: another writer may still be settling it
        let early = h.engine.reconcile(alice_sess_1()).await.unwrap();
        assert!(early.is_duplicate);
        assert_eq!(h.store.customer("alice@example.com").unwrap().total_earnings, 2000);

        h.store.backdate_booking(booking.id, Utc::now() - Duration::seconds(120));
        h.engine.reconcile(alice_sess_1()).await.unwrap();
        h.engine.reconcile(alice_sess_1()).await.unwrap();

        let alice = h.store.customer("alice@example.com").unwrap();
        assert_eq!(alice.total_earnings, 0);
        assert_eq!(alice.services_booked, 1);
    }

    #[tokio::test]
    async fn test_referrer_paid_once_on_first_booking() {
        let h = harness();
        let carol = h
            .ledger
            .register_customer(Registration {
                email: "carol@example.com".to_string(),
                name: "Carol".to_string(),
                phone: None,
                referral_code: None,
            })
            .await
            .unwrap();
        h.ledger
            .register_customer(Registration {
                email: "bob@example.com".to_string(),
                name: "Bob".to_string(),
                phone: None,
                referral_code: Some(carol.account.referral_code.clone()),
            })
            .await
            .unwrap();

        let bob_first = intent(Some("sess_bob_1"), "bob@example.com", vec![line("l0", "MOT", 5485)]);
        h.engine.reconcile(bob_first.clone()).await.unwrap();
        h.engine.reconcile(bob_first).await.unwrap();
        assert_eq!(h.store.customer("carol@example.com").unwrap().total_earnings, 1000);

        let mut bob_second = intent(Some("sess_bob_2"), "bob@example.com", vec![line("l0", "Oil Change", 4999)]);
        bob_second.vehicle.registration = "XY34ZZZ".to_string();
        h.engine.reconcile(bob_second).await.unwrap();

        let carol = h.store.customer("carol@example.com").unwrap();
        assert_eq!(carol.total_earnings, 1000);
        assert_eq!(carol.referral_balance, 1000);
        assert_eq!(h.store.referral_for("bob@example.com").unwrap().status, ReferralStatus::Completed);
        assert_eq!(h.store.customer("bob@example.com").unwrap().services_booked, 2);
    }

    #[tokio::test]
    async fn test_notification_failure_is_warning_only() {
        let h = harness();
        h.notifier.deliver.store(false, Ordering::SeqCst);
        h.store.fail_publishing(true);

        let outcome = h.engine.reconcile(alice_sess_1()).await.unwrap();

        assert!(!outcome.is_duplicate);
        assert_eq!(outcome.warnings.len(), 2);
        assert_eq!(h.store.booking_count(), 1);
    }

    #[tokio::test]
    async fn test_double_submit_without_session_collapses() {
        let h = harness();
        let direct = || {
            let mut i = intent(None, "alice@example.com", vec![line("l0", "Full Service", 10000)]);
            i.source = TriggerSource::DirectCreate;
            i
        };

        let first = h.engine.reconcile(direct()).await.unwrap();
        let second = h.engine.reconcile(direct()).await.unwrap();

        assert!(second.is_duplicate);
        assert_eq!(first.booking_id, second.booking_id);
        assert_eq!(h.store.booking_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_sessions_are_distinct_bookings() {
        let h = harness();
        h.engine.reconcile(alice_sess_1()).await.unwrap();

        let mut other = alice_sess_1();
        other.payment_session_id = Some("sess_2".to_string());
        let outcome = h.engine.reconcile(other).await.unwrap();

        assert!(!outcome.is_duplicate);
        assert_eq!(h.store.booking_count(), 2);
    }

    #[tokio::test]
    async fn test_other_session_in_flight_gets_retry_signal() {
        let h = harness();
        h.store.try_acquire("alice@example.com", "sess_other", 30).await.unwrap();

        let err = h.engine.reconcile(alice_sess_1()).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert_eq!(h.store.booking_count(), 0);

        h.store.release("alice@example.com", "sess_other").await.unwrap();
        assert!(h.engine.reconcile(alice_sess_1()).await.is_ok());
    }

    #[tokio::test]
    async fn test_ledger_refusal_reported_as_warning() {
        let h = harness();
        seed(&h.store, "alice@example.com", 2000);

        // Earnings drained between the read and the settlement
        let mut booking = build_booking(&alice_sess_1(), 2000);
        booking.created_at = Utc::now() - Duration::seconds(300);
        BookingRepository::insert(&*h.store, &booking).await.unwrap();
        assert!(h.store.debit_earnings("alice@example.com", 1500).await.unwrap());

        let outcome = h.engine.reconcile(alice_sess_1()).await.unwrap();
        assert!(outcome.warnings.iter().any(|w| w.starts_with("earnings not debited")));
        assert_eq!(h.store.customer("alice@example.com").unwrap().total_earnings, 500);
    }

    async fn referred_pair(h: &Harness) {
        let carol = h
            .ledger
            .register_customer(Registration {
                email: "carol@example.com".to_string(),
                name: "Carol".to_string(),
                phone: None,
                referral_code: None,
            })
            .await
            .unwrap();
        h.ledger
            .register_customer(Registration {
                email: "bob@example.com".to_string(),
                name: "Bob".to_string(),
                phone: None,
                referral_code: Some(carol.account.referral_code),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_session_attached_when_webhook_follows_direct_create() {
        let h = harness();
        seed(&h.store, "alice@example.com", 0);
        let mut direct = alice_sess_1();
        direct.payment_session_id = None;
        direct.source = TriggerSource::DirectCreate;

        let created = h.engine.reconcile(direct).await.unwrap();
        let from_webhook = h.engine.reconcile(alice_sess_1()).await.unwrap();

        assert!(from_webhook.is_duplicate);
        assert_eq!(from_webhook.booking_id, created.booking_id);
        let booking = h.store.find_by_session("sess_1").await.unwrap().unwrap();
        assert_eq!(booking.id, created.booking_id);

        // Well past the double-submit window, only the session match remains
        h.store.backdate_booking(created.booking_id, Utc::now() - Duration::seconds(600));
        let redelivered = h.engine.reconcile(alice_sess_1()).await.unwrap();

        assert!(redelivered.is_duplicate);
        assert_eq!(redelivered.booking_id, created.booking_id);
        assert_eq!(h.store.booking_count(), 1);
        assert_eq!(h.store.history_count(), 1);
        assert_eq!(h.store.customer("alice@example.com").unwrap().services_booked, 1);
    }

    #[tokio::test]
    async fn test_session_owned_elsewhere_is_not_attached() {
        let h = harness();
        let mut direct = alice_sess_1();
        direct.payment_session_id = None;
        let created = h.engine.reconcile(direct).await.unwrap();

        // sess_1 already belongs to an older booking outside the window
        let mut older = build_booking(&alice_sess_1(), 0);
        older.created_at = Utc::now() - Duration::seconds(600);
        BookingRepository::insert(&*h.store, &older).await.unwrap();
        h.store.stale_session_lookups(1);

        let outcome = h.engine.reconcile(alice_sess_1()).await.unwrap();

        assert!(outcome.is_duplicate);
        assert_eq!(outcome.booking_id, older.id);
        let untouched = BookingRepository::get(&*h.store, created.booking_id).await.unwrap().unwrap();
        assert!(untouched.payment_session_id.is_none());
    }

    #[tokio::test]
    async fn test_multi_line_without_session_keys_by_booking() {
        let h = harness();
        let checkout = intent(
            None,
            "alice@example.com",
            vec![line("oil", "Oil Change", 5000), line("mot", "MOT", 5485)],
        );

        let outcome = h.engine.reconcile(checkout.clone()).await.unwrap();
        let again = h.engine.reconcile(checkout).await.unwrap();

        assert!(again.is_duplicate);
        assert_eq!(again.history_ids, outcome.history_ids);
        let rows = h.store.list_by_booking(outcome.booking_id).await.unwrap();
        let mut keys: Vec<String> = rows.iter().map(|r| r.history_key.clone()).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![format!("{}:mot", outcome.booking_id), format!("{}:oil", outcome.booking_id)]
        );
    }

    #[tokio::test]
    async fn test_repeated_client_line_ids_get_a_row_each() {
        let h = harness();
        let body = serde_json::json!({
            "customer": {"name": "Alice", "email": "alice@example.com"},
            "vehicle": {"registration": "AB12CDE"},
            "services": [
                {"id": "a", "label": "Oil Change", "price": 50},
                {"id": "line2", "label": "MOT", "price": 54.85},
                {"id": "line2", "label": "Wipers", "price": 12}
            ],
            "paymentSessionId": "sess_lines"
        });
        let request: crate::DirectBookingRequest = serde_json::from_value(body).unwrap();
        let checkout = ReconciliationIntent::from_direct(
            request,
            NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        )
        .unwrap();

        let outcome = h.engine.reconcile(checkout).await.unwrap();

        let mut ids = outcome.history_ids.clone();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(h.store.history_count(), 3);
    }

    #[tokio::test]
    async fn test_transient_bonus_failure_retried() {
        let h = harness();
        referred_pair(&h).await;
        h.store.fail_bonus_payments(1);

        let outcome = h
            .engine
            .reconcile(intent(Some("sess_bob_1"), "bob@example.com", vec![line("l0", "MOT", 5485)]))
            .await
            .unwrap();

        assert!(outcome.warnings.is_empty());
        assert_eq!(h.store.customer("carol@example.com").unwrap().total_earnings, 1000);
        assert!(h.store.referral_for("bob@example.com").unwrap().bonus_paid);
    }

    #[tokio::test]
    async fn test_failed_bonus_leaves_referral_payable() {
        let h = harness();
        referred_pair(&h).await;
        h.store.fail_bonus_payments(10);

        let outcome = h
            .engine
            .reconcile(intent(Some("sess_bob_1"), "bob@example.com", vec![line("l0", "MOT", 5485)]))
            .await
            .unwrap();

        assert!(outcome.warnings.iter().any(|w| w.starts_with("referral bonus not paid")));
        assert_eq!(h.store.customer("carol@example.com").unwrap().total_earnings, 0);
        let referral = h.store.referral_for("bob@example.com").unwrap();
        assert!(!referral.bonus_paid);
        assert_eq!(referral.status, ReferralStatus::Pending);
    }

    #[test]
    fn test_apportion() {
        assert_eq!(apportion(3000, &[5000, 5000]), vec![1500, 1500]);
        assert_eq!(apportion(1000, &[1, 1, 1]), vec![334, 333, 333]);
        assert_eq!(apportion(500, &[0, 0]), vec![500, 0]);
    }
}
