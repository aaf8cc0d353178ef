use uuid::Uuid;

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct BookingConfirmedEvent {
    pub booking_id: Uuid,
    pub payment_session_id: Option<String>,
    pub customer_email: String,
    pub amount_charged: i64,
    pub earnings_applied: i64,
    pub timestamp: i64,
}

/// Envelope handed to the email worker through the event bus.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct NotificationRequested {
    pub recipient: String,
    pub template: String,
    pub data: serde_json::Value,
    pub requested_at: i64,
}
