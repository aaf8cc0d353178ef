use axum::{http::Method, routing::get, Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod bookings;
pub mod checkout;
pub mod error;
pub mod metrics;
pub mod referrals;
pub mod reminders;
pub mod state;
pub mod webhooks;

pub use state::{AppState, Backends, DomainSettings};

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::USER_AGENT,
        ]);

    Router::new()
        .route("/health", get(health))
        .merge(checkout::routes())
        .merge(webhooks::routes())
        .merge(bookings::routes())
        .merge(referrals::routes())
        .merge(reminders::routes())
        .merge(metrics::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
