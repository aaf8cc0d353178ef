use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use wrench_shared::Pence;

/// Booking lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::InProgress => "in-progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "in-progress" => Ok(BookingStatus::InProgress),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(format!("unknown payment status: {}", other)),
        }
    }
}

/// Which entry point delivered the payment confirmation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerSource {
    Webhook,
    SessionConfirm,
    DirectCreate,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Webhook => "webhook",
            TriggerSource::SessionConfirm => "session-confirm",
            TriggerSource::DirectCreate => "direct-create",
        }
    }
}

impl FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(TriggerSource::Webhook),
            "session-confirm" => Ok(TriggerSource::SessionConfirm),
            "direct-create" => Ok(TriggerSource::DirectCreate),
            other => Err(format!("unknown trigger source: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomerSnapshot {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VehicleSnapshot {
    pub make: String,
    pub model: String,
    pub year: Option<i32>,
    pub registration: String,
}

/// One purchased service as it was priced at checkout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceLine {
    pub line_id: String,
    pub label: String,
    pub price: Pence,
    pub labour_hours: f64,
    pub labour_cost: Pence,
    pub parts_cost: Pence,
}

/// Monetary breakdown of a booking.
///
/// `nominal_total` is what the services cost before any referral earnings
/// were spent; `total` is what the customer was actually charged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BookingTotals {
    pub subtotal: Pence,
    pub labour_cost: Pence,
    pub parts_cost: Pence,
    pub vat: Pence,
    pub nominal_total: Pence,
    pub earnings_applied: Pence,
    pub total: Pence,
    pub amount_captured: Option<Pence>,
}

/// The commercial record of a scheduled, paid service engagement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: Uuid,
    pub payment_session_id: Option<String>,
    pub customer: CustomerSnapshot,
    pub vehicle: VehicleSnapshot,
    pub services: Vec<ServiceLine>,
    pub totals: BookingTotals,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub scheduled_date: NaiveDate,
    pub scheduled_time: NaiveTime,
    pub source: TriggerSource,
    /// Set once the referral ledger has been settled for this booking
    pub ledger_settled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn is_open(&self) -> bool {
        self.status != BookingStatus::Cancelled
    }

    /// Label of the first service line, used for double-submit matching
    pub fn primary_label(&self) -> Option<&str> {
        self.services.first().map(|s| s.label.as_str())
    }
}

/// Emails are the customer identity across stores
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// `ab12 cde` and `AB12CDE` are the same vehicle
pub fn normalize_registration(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_uppercase()
}

/// Idempotency key of the history row for one service line.
///
/// The first line carries the bare session id so a single-service checkout
/// is addressable by session alone; later lines append their line id.
pub fn history_key(session_id: Option<&str>, booking_id: Uuid, index: usize, line_id: &str) -> String {
    match session_id {
        Some(session) if index == 0 => session.to_string(),
        Some(session) => format!("{}:{}", session, line_id),
        None => format!("{}:{}", booking_id, line_id),
    }
}

/// Customer-facing receipt of one purchased service line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: Uuid,
    pub history_key: String,
    pub booking_id: Uuid,
    pub payment_session_id: Option<String>,
    pub customer_email: String,
    pub vehicle: VehicleSnapshot,
    pub service: ServiceLine,
    pub earnings_applied: Pence,
    pub amount_charged: Pence,
    pub status: BookingStatus,
    pub service_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ledger-relevant view of a customer account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerAccount {
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub referral_code: String,
    pub referral_balance: Pence,
    pub total_earnings: Pence,
    pub services_booked: i64,
    pub referred_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CustomerAccount {
    pub fn new(email: String, name: String, phone: Option<String>, referral_code: String) -> Self {
        Self {
            email,
            name,
            phone,
            referral_code,
            referral_balance: 0,
            total_earnings: 0,
            services_booked: 0,
            referred_by: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReferralStatus {
    Pending,
    Completed,
}

impl ReferralStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferralStatus::Pending => "pending",
            ReferralStatus::Completed => "completed",
        }
    }
}

impl FromStr for ReferralStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReferralStatus::Pending),
            "completed" => Ok(ReferralStatus::Completed),
            other => Err(format!("unknown referral status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Referral {
    pub id: Uuid,
    pub referrer_email: String,
    pub code: String,
    pub referred_email: String,
    pub referred_name: String,
    pub status: ReferralStatus,
    pub bonus_amount: Pence,
    pub bonus_paid: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Referral {
    pub fn new(referrer_email: String, code: String, referred_email: String, referred_name: String, bonus_amount: Pence) -> Self {
        Self {
            id: Uuid::new_v4(),
            referrer_email,
            code,
            referred_email,
            referred_name,
            status: ReferralStatus::Pending,
            bonus_amount,
            bonus_paid: false,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Eligible for payout: not yet paid, whatever its status says
    pub fn is_payable(&self) -> bool {
        !self.bonus_paid
    }
}
