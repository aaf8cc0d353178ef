use axum::{extract::State, routing::post, Json, Router};
use chrono::{NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wrench_booking::intent::parse_time;
use wrench_booking::{DirectBookingRequest, ReconcileOutcome, ReconciliationIntent};
use wrench_core::models::TriggerSource;
use wrench_core::CoreError;

use crate::error::AppError;
use crate::state::AppState;

/// What every trigger entry point answers, reconciled or deduplicated alike
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub success: bool,
    pub booking_id: Option<Uuid>,
    pub is_duplicate: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl From<ReconcileOutcome> for TriggerResponse {
    fn from(outcome: ReconcileOutcome) -> Self {
        let message = if outcome.is_duplicate {
            "Booking already exists for this payment"
        } else {
            "Booking confirmed"
        };
        Self {
            success: true,
            booking_id: Some(outcome.booking_id),
            is_duplicate: outcome.is_duplicate,
            message: message.to_string(),
            warnings: outcome.warnings,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmSessionRequest {
    pub session_id: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/checkout/confirm", post(confirm_session))
        .route("/v1/checkout/direct", post(direct_create))
}

pub(crate) fn default_time(state: &AppState) -> NaiveTime {
    let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN);
    parse_time(Some(&state.reconciler.settings().default_time), nine).unwrap_or(nine)
}

/// Run the engine and count the outcome
pub(crate) async fn reconcile(state: &AppState, intent: ReconciliationIntent) -> Result<ReconcileOutcome, CoreError> {
    let source = intent.source.as_str();
    let result = state.reconciler.reconcile(intent).await;
    let outcome = match &result {
        Ok(o) if o.is_duplicate => "duplicate",
        Ok(_) => "created",
        Err(e) if e.is_retryable() => "retry",
        Err(CoreError::ValidationError(_)) => "invalid",
        Err(_) => "error",
    };
    state.metrics.record(source, outcome);
    result
}

/// POST /v1/checkout/confirm
/// Client-side confirmation after the gateway redirects back
async fn confirm_session(
    State(state): State<AppState>,
    Json(req): Json<ConfirmSessionRequest>,
) -> Result<Json<TriggerResponse>, AppError> {
    let session_id = req.session_id.trim();
    if session_id.is_empty() {
        return Err(AppError::ValidationError("sessionId is required".to_string()));
    }

    let session = state
        .gateway
        .retrieve_session(session_id)
        .await
        .map_err(CoreError::from)?;

    if !session.is_paid() {
        return Err(AppError::ValidationError(format!(
            "payment for session {} is not complete ({})",
            session.id, session.payment_status
        )));
    }

    let today = Utc::now().date_naive();
    let intent = ReconciliationIntent::from_session(&session, TriggerSource::SessionConfirm, today, default_time(&state))?;
    let outcome = reconcile(&state, intent).await?;
    Ok(Json(outcome.into()))
}

/// POST /v1/checkout/direct
/// Booking created straight from the client's own copy of the basket
async fn direct_create(
    State(state): State<AppState>,
    Json(req): Json<DirectBookingRequest>,
) -> Result<Json<TriggerResponse>, AppError> {
    let today = Utc::now().date_naive();
    let intent = ReconciliationIntent::from_direct(req, today, default_time(&state))?;
    let outcome = reconcile(&state, intent).await?;
    Ok(Json(outcome.into()))
}
