use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::AppError;
use crate::state::AppState;

pub struct Metrics {
    registry: Registry,
    /// Reconciliations by trigger source and outcome
    pub reconciliations: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let reconciliations = IntCounterVec::new(
            Opts::new("wrench_reconciliations_total", "Checkout reconciliations by source and outcome"),
            &["source", "outcome"],
        )?;
        registry.register(Box::new(reconciliations.clone()))?;
        Ok(Self { registry, reconciliations })
    }

    pub fn record(&self, source: &str, outcome: &str) {
        self.reconciliations.with_label_values(&[source, outcome]).inc();
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics))
}

async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let body = state
        .metrics
        .render()
        .map_err(|e| AppError::InternalServerError(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
