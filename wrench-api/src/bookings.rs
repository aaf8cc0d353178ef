use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;
use wrench_core::models::{normalize_email, Booking, BookingStatus, HistoryRecord, PaymentStatus};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CustomerQuery {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: BookingStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusUpdate {
    pub payment_status: PaymentStatus,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/bookings", get(list_bookings))
        .route("/v1/bookings/{id}", get(get_booking))
        .route("/v1/bookings/session/{session_id}", get(get_booking_by_session))
        .route("/v1/bookings/{id}/status", post(update_status))
        .route("/v1/bookings/{id}/payment-status", post(update_payment_status))
        .route("/v1/history", get(list_history))
}

/// GET /v1/bookings?email=
async fn list_bookings(
    State(state): State<AppState>,
    Query(query): Query<CustomerQuery>,
) -> Result<Json<Vec<Booking>>, AppError> {
    Ok(Json(state.bookings.list_for_customer(&query.email).await?))
}

async fn get_booking(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Booking>, AppError> {
    Ok(Json(state.bookings.get(id).await?))
}

async fn get_booking_by_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Booking>, AppError> {
    Ok(Json(state.bookings.find_by_session(&session_id).await?))
}

/// POST /v1/bookings/{id}/status
async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StatusUpdate>,
) -> Result<Json<Booking>, AppError> {
    Ok(Json(state.bookings.transition(id, req.status).await?))
}

async fn update_payment_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PaymentStatusUpdate>,
) -> Result<Json<Booking>, AppError> {
    Ok(Json(state.bookings.update_payment_status(id, req.payment_status).await?))
}

/// GET /v1/history?email=
/// Per-service receipts for the customer dashboard
async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<CustomerQuery>,
) -> Result<Json<Vec<HistoryRecord>>, AppError> {
    Ok(Json(state.history.list_by_customer(&normalize_email(&query.email)).await?))
}
