use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use wrench_maintenance::Reminder;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/customers/{email}/reminders", get(list_reminders))
}

/// GET /v1/customers/{email}/reminders
async fn list_reminders(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<Json<Vec<Reminder>>, AppError> {
    let today = Utc::now().date_naive();
    let reminders = state
        .scheduler
        .reminders_for(state.history.as_ref(), state.booking_store.as_ref(), &email, today)
        .await?;
    Ok(Json(reminders))
}
