use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use wrench_core::models::Referral;
use wrench_referral::{CodeValidation, ReferralSummary, Registration, RegistrationOutcome};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterCustomerRequest {
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub referral_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReferralRequest {
    pub code: String,
    pub referred_email: String,
    pub referred_name: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/customers", post(register_customer))
        .route("/v1/customers/{email}/referrals", get(referral_summary))
        .route("/v1/referrals", post(create_referral))
        .route("/v1/referrals/validate/{code}", get(validate_code))
}

/// POST /v1/customers
async fn register_customer(
    State(state): State<AppState>,
    Json(req): Json<RegisterCustomerRequest>,
) -> Result<(StatusCode, Json<RegistrationOutcome>), AppError> {
    if req.email.trim().is_empty() || req.name.trim().is_empty() {
        return Err(AppError::ValidationError("email and name are required".to_string()));
    }

    let outcome = state
        .ledger
        .register_customer(Registration {
            email: req.email,
            name: req.name,
            phone: req.phone,
            referral_code: req.referral_code,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn validate_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<CodeValidation>, AppError> {
    Ok(Json(state.ledger.validate_code(&code).await?))
}

/// POST /v1/referrals
async fn create_referral(
    State(state): State<AppState>,
    Json(req): Json<CreateReferralRequest>,
) -> Result<(StatusCode, Json<Referral>), AppError> {
    let referral = state
        .ledger
        .create_referral(&req.code, &req.referred_email, &req.referred_name)
        .await?;
    Ok((StatusCode::CREATED, Json(referral)))
}

/// GET /v1/customers/{email}/referrals
/// Balance, lifetime earnings and the customer's referrals
async fn referral_summary(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<Json<ReferralSummary>, AppError> {
    Ok(Json(state.ledger.summary(&email).await?))
}
