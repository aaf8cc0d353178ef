use std::sync::Arc;
use wrench_booking::{BookingManager, Collaborators, Reconciler};
use wrench_core::notify::{EventPublisher, Notifier};
use wrench_core::payment::PaymentGateway;
use wrench_core::repository::{
    BookingRepository, CustomerRepository, HistoryRepository, InFlightGuard, ReferralRepository,
};
use wrench_core::settings::{MaintenanceSettings, ReconciliationSettings, ReferralSettings};
use wrench_maintenance::MaintenanceScheduler;
use wrench_referral::ReferralLedger;

use crate::metrics::Metrics;

/// Storage and outbound collaborators, Postgres/Redis/Kafka in production
#[derive(Clone)]
pub struct Backends {
    pub bookings: Arc<dyn BookingRepository>,
    pub history: Arc<dyn HistoryRepository>,
    pub customers: Arc<dyn CustomerRepository>,
    pub referrals: Arc<dyn ReferralRepository>,
    pub guard: Arc<dyn InFlightGuard>,
    pub events: Arc<dyn EventPublisher>,
    pub notifier: Arc<dyn Notifier>,
    pub gateway: Arc<dyn PaymentGateway>,
}

#[derive(Debug, Clone)]
pub struct DomainSettings {
    pub reconciliation: ReconciliationSettings,
    pub referral: ReferralSettings,
    pub maintenance: MaintenanceSettings,
    pub booking_topic: String,
}

impl Default for DomainSettings {
    fn default() -> Self {
        Self {
            reconciliation: ReconciliationSettings::default(),
            referral: ReferralSettings::default(),
            maintenance: MaintenanceSettings::default(),
            booking_topic: "booking.confirmed".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub bookings: Arc<BookingManager>,
    pub booking_store: Arc<dyn BookingRepository>,
    pub history: Arc<dyn HistoryRepository>,
    pub ledger: Arc<ReferralLedger>,
    pub scheduler: Arc<MaintenanceScheduler>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn build(backends: Backends, settings: DomainSettings) -> Result<Self, prometheus::Error> {
        let ledger = Arc::new(ReferralLedger::new(
            backends.customers.clone(),
            backends.referrals.clone(),
            settings.referral.clone(),
        ));

        let reconciler = Reconciler::new(
            Collaborators {
                bookings: backends.bookings.clone(),
                history: backends.history.clone(),
                guard: backends.guard.clone(),
                notifier: backends.notifier.clone(),
                events: backends.events.clone(),
                booking_topic: settings.booking_topic.clone(),
            },
            ledger.clone(),
            settings.reconciliation.clone(),
        );

        Ok(Self {
            reconciler: Arc::new(reconciler),
            bookings: Arc::new(BookingManager::new(backends.bookings.clone(), backends.history.clone())),
            booking_store: backends.bookings,
            history: backends.history,
            ledger,
            scheduler: Arc::new(MaintenanceScheduler::from_settings(&settings.maintenance)),
            gateway: backends.gateway,
            metrics: Arc::new(Metrics::new()?),
        })
    }
}
