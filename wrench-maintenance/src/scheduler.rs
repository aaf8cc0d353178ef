use chrono::{Duration, NaiveDate};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;
use wrench_core::models::{normalize_email, normalize_registration, Booking, BookingStatus, HistoryRecord, VehicleSnapshot};
use wrench_core::repository::{BookingRepository, HistoryRepository, StoreResult};
use wrench_core::settings::MaintenanceSettings;

use crate::intervals::{normalize_label, IntervalTable};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn from_days_until(days: i64) -> Self {
        if days <= 3 {
            Priority::High
        } else if days <= 7 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReminderKind {
    /// A service is coming due again
    Maintenance,
    /// An already booked appointment is coming up
    Scheduled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub kind: ReminderKind,
    pub registration: String,
    pub vehicle: String,
    pub service_label: String,
    pub last_service_date: Option<NaiveDate>,
    pub due_date: NaiveDate,
    /// Negative when overdue
    pub days_until: i64,
    pub priority: Priority,
    pub booking_id: Option<Uuid>,
}

struct LastOccurrence<'a> {
    date: NaiveDate,
    label: &'a str,
    vehicle: &'a VehicleSnapshot,
}

/// Derives maintenance reminders from a customer's service history and
/// bookings. Holds no state beyond its configuration.
pub struct MaintenanceScheduler {
    intervals: IntervalTable,
    look_ahead_days: i64,
    look_behind_days: i64,
}

impl MaintenanceScheduler {
    pub fn new(intervals: IntervalTable, look_ahead_days: i64, look_behind_days: i64) -> Self {
        Self {
            intervals,
            look_ahead_days,
            look_behind_days,
        }
    }

    pub fn from_settings(settings: &MaintenanceSettings) -> Self {
        Self::new(
            IntervalTable::from_settings(settings),
            settings.look_ahead_days,
            settings.look_behind_days,
        )
    }

    pub fn compute(&self, history: &[HistoryRecord], bookings: &[Booking], today: NaiveDate) -> Vec<Reminder> {
        let mut reminders = self.maintenance_due(history, bookings, today);
        reminders.extend(self.upcoming_appointments(bookings, today));
        reminders.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.days_until.cmp(&b.days_until)));
        reminders
    }

    fn maintenance_due(&self, history: &[HistoryRecord], bookings: &[Booking], today: NaiveDate) -> Vec<Reminder> {
        let mut latest: HashMap<(String, String), LastOccurrence> = HashMap::new();
        for row in history.iter().filter(|h| h.status != BookingStatus::Cancelled) {
            note_occurrence(&mut latest, row.service_date, &row.service.label, &row.vehicle);
        }
        for booking in bookings.iter().filter(|b| b.is_open()) {
            for line in &booking.services {
                note_occurrence(&mut latest, booking.scheduled_date, &line.label, &booking.vehicle);
            }
        }

        let earliest = today - Duration::days(self.look_behind_days);
        let latest_due = today + Duration::days(self.look_ahead_days);

        latest
            .into_iter()
            .filter_map(|((registration, _), last)| {
                let due_date = last.date + Duration::days(self.intervals.interval_days(last.label));
                if due_date < earliest || due_date > latest_due {
                    return None;
                }
                let days_until = (due_date - today).num_days();
                Some(Reminder {
                    kind: ReminderKind::Maintenance,
                    registration,
                    vehicle: describe(last.vehicle),
                    service_label: last.label.to_string(),
                    last_service_date: Some(last.date),
                    due_date,
                    days_until,
                    priority: Priority::from_days_until(days_until),
                    booking_id: None,
                })
            })
            .collect()
    }

    fn upcoming_appointments(&self, bookings: &[Booking], today: NaiveDate) -> Vec<Reminder> {
        let horizon = today + Duration::days(self.look_ahead_days);
        bookings
            .iter()
            .filter(|b| !matches!(b.status, BookingStatus::Cancelled | BookingStatus::Completed))
            .filter(|b| b.scheduled_date >= today && b.scheduled_date <= horizon)
            .map(|b| {
                let days_until = (b.scheduled_date - today).num_days();
                Reminder {
                    kind: ReminderKind::Scheduled,
                    registration: normalize_registration(&b.vehicle.registration),
                    vehicle: describe(&b.vehicle),
                    service_label: b.services.iter().map(|s| s.label.as_str()).collect::<Vec<_>>().join(", "),
                    last_service_date: None,
                    due_date: b.scheduled_date,
                    days_until,
                    priority: Priority::from_days_until(days_until),
                    booking_id: Some(b.id),
                }
            })
            .collect()
    }

    /// Load the customer's records and compute their reminders
    pub async fn reminders_for(
        &self,
        history: &dyn HistoryRepository,
        bookings: &dyn BookingRepository,
        customer_email: &str,
        today: NaiveDate,
    ) -> StoreResult<Vec<Reminder>> {
        let email = normalize_email(customer_email);
        let rows = history.list_by_customer(&email).await?;
        let open = bookings.list_by_customer(&email).await?;
        let reminders = self.compute(&rows, &open, today);
        tracing::debug!(
            "Computed {} reminders for {}",
            reminders.len(),
            wrench_shared::pii::masked(&email)
        );
        Ok(reminders)
    }
}

fn note_occurrence<'a>(
    latest: &mut HashMap<(String, String), LastOccurrence<'a>>,
    date: NaiveDate,
    label: &'a str,
    vehicle: &'a VehicleSnapshot,
) {
    let key = (normalize_registration(&vehicle.registration), normalize_label(label));
    match latest.get(&key) {
        Some(existing) if existing.date >= date => {}
        _ => {
            latest.insert(key, LastOccurrence { date, label, vehicle });
        }
    }
}

fn describe(vehicle: &VehicleSnapshot) -> String {
    match vehicle.year {
        Some(year) => format!("{} {} ({})", vehicle.make, vehicle.model, year),
        None => format!("{} {}", vehicle.make, vehicle.model),
    }
}
