use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use wrench_core::models::{normalize_email, Booking, BookingStatus, PaymentStatus};
use wrench_core::repository::{BookingRepository, HistoryRepository};
use wrench_core::{CoreError, StoreError};

/// Administrative lookups and status edits on reconciled bookings
pub struct BookingManager {
    bookings: Arc<dyn BookingRepository>,
    history: Arc<dyn HistoryRepository>,
}

impl BookingManager {
    pub fn new(bookings: Arc<dyn BookingRepository>, history: Arc<dyn HistoryRepository>) -> Self {
        Self { bookings, history }
    }

    pub async fn get(&self, id: Uuid) -> Result<Booking, TransitionError> {
        self.bookings
            .get(id)
            .await?
            .ok_or_else(|| TransitionError::NotFound(id.to_string()))
    }

    pub async fn find_by_session(&self, session_id: &str) -> Result<Booking, TransitionError> {
        self.bookings
            .find_by_session(session_id)
            .await?
            .ok_or_else(|| TransitionError::NotFound(session_id.to_string()))
    }

    pub async fn list_for_customer(&self, email: &str) -> Result<Vec<Booking>, TransitionError> {
        Ok(self.bookings.list_by_customer(&normalize_email(email)).await?)
    }

    /// Move a booking to `to`, mirroring the status onto its history rows
    pub async fn transition(&self, id: Uuid, to: BookingStatus) -> Result<Booking, TransitionError> {
        let mut booking = self.get(id).await?;
        if !booking_transition_allowed(booking.status, to) {
            return Err(TransitionError::InvalidTransition {
                from: booking.status.to_string(),
                to: to.to_string(),
            });
        }

        self.bookings.update_status(id, to, booking.payment_status).await?;
        self.history.update_status_for_booking(id, to).await?;
        info!("Booking {} moved {} -> {}", id, booking.status, to);

        booking.status = to;
        Ok(booking)
    }

    pub async fn update_payment_status(&self, id: Uuid, to: PaymentStatus) -> Result<Booking, TransitionError> {
        let mut booking = self.get(id).await?;
        if !payment_transition_allowed(booking.payment_status, to) {
            return Err(TransitionError::InvalidTransition {
                from: booking.payment_status.to_string(),
                to: to.to_string(),
            });
        }

        self.bookings.update_status(id, booking.status, to).await?;
        info!("Booking {} payment {} -> {}", id, booking.payment_status, to);

        booking.payment_status = to;
        Ok(booking)
    }
}

pub fn booking_transition_allowed(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;
    matches!(
        (from, to),
        (Pending, Confirmed)
            | (Pending, Cancelled)
            | (Confirmed, InProgress)
            | (Confirmed, Cancelled)
            | (InProgress, Completed)
            | (InProgress, Cancelled)
    )
}

pub fn payment_transition_allowed(from: PaymentStatus, to: PaymentStatus) -> bool {
    use PaymentStatus::*;
    matches!((from, to), (Pending, Paid) | (Pending, Failed) | (Paid, Refunded))
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("Booking not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TransitionError> for CoreError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::NotFound(msg) => CoreError::NotFound(msg),
            e @ TransitionError::InvalidTransition { .. } => CoreError::ValidationError(e.to_string()),
            TransitionError::Store(e) => e.into(),
        }
    }
}
