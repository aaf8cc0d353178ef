use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use wrench_booking::ReconciliationIntent;
use wrench_core::models::TriggerSource;
use wrench_core::payment::CheckoutSession;
use wrench_core::CoreError;

use crate::checkout::{default_time, reconcile, TriggerResponse};
use crate::error::AppError;
use crate::state::AppState;

const RECONCILED_EVENTS: &[&str] = &["checkout.session.completed", "checkout.session.async_payment_succeeded"];

#[derive(Debug, Deserialize)]
pub struct GatewayWebhook {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub data: WebhookData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    pub object: serde_json::Value,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/webhooks/payments", post(handle_payment_webhook))
}

/// POST /v1/webhooks/payments
/// Receive checkout events from the payment gateway.
///
/// Anything other than a 2xx makes the gateway redeliver, so only retryable
/// failures are reported as errors. Events we do not reconcile, unpaid
/// sessions and unusable metadata are acknowledged.
pub async fn handle_payment_webhook(
    State(state): State<AppState>,
    Json(payload): Json<GatewayWebhook>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    tracing::info!("Received webhook {}: {}", payload.id, payload.type_);

    if !RECONCILED_EVENTS.contains(&payload.type_.as_str()) {
        return Ok(acknowledged("ignored event type"));
    }

    let session: CheckoutSession = match serde_json::from_value(payload.data.object) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Webhook {} carries a malformed checkout session: {}", payload.id, e);
            return Ok(acknowledged("malformed session"));
        }
    };

    if !session.is_paid() {
        tracing::info!("Session {} not paid ({}), nothing to reconcile", session.id, session.payment_status);
        return Ok(acknowledged("payment not complete"));
    }

    let today = Utc::now().date_naive();
    let intent = match ReconciliationIntent::from_session(&session, TriggerSource::Webhook, today, default_time(&state)) {
        Ok(intent) => intent,
        Err(e) => {
            // Redelivery cannot fix bad metadata
            tracing::error!("Session {} cannot be reconciled: {}", session.id, e);
            return Ok(acknowledged("session metadata unusable"));
        }
    };

    match reconcile(&state, intent).await {
        Ok(outcome) => {
            let body = serde_json::to_value(TriggerResponse::from(outcome))
                .map_err(|e| AppError::InternalServerError(e.to_string()))?;
            Ok((StatusCode::OK, Json(body)))
        }
        Err(CoreError::ValidationError(msg)) => {
            tracing::error!("Session {} rejected: {}", session.id, msg);
            Ok(acknowledged("session rejected"))
        }
        Err(e) => Err(e.into()),
    }
}

fn acknowledged(reason: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "bookingId": null,
            "isDuplicate": false,
            "message": reason,
        })),
    )
}
