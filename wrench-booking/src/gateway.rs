//! Payment gateway adapters: the HTTP client used in production and a
//! static table for local runs and tests.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use wrench_core::payment::{CheckoutSession, GatewayError, PaymentGateway};

/// Retrieves checkout sessions from the gateway's REST API
#[derive(Clone)]
pub struct HttpPaymentGateway {
    base_url: String,
    secret_key: String,
    client: reqwest::Client,
}

impl HttpPaymentGateway {
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>, timeout_seconds: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into(),
            secret_key: secret_key.into(),
            client,
        }
    }

    fn session_url(&self, session_id: &str) -> String {
        format!(
            "{}/v1/checkout/sessions/{}",
            self.base_url.trim_end_matches('/'),
            session_id
        )
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession, GatewayError> {
        let response = self
            .client
            .get(self.session_url(session_id))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("session lookup failed: {e}")))?;

        match response.status() {
            status if status.is_success() => response
                .json::<CheckoutSession>()
                .await
                .map_err(|e| GatewayError::InvalidResponse(format!("invalid session body: {e}"))),
            StatusCode::NOT_FOUND => Err(GatewayError::SessionNotFound(session_id.to_string())),
            status if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
                Err(GatewayError::Unavailable(format!("gateway returned {status}")))
            }
            status => Err(GatewayError::InvalidResponse(format!("gateway returned {status}"))),
        }
    }
}

/// Serves sessions registered up front
#[derive(Default)]
pub struct StaticGateway {
    sessions: RwLock<HashMap<String, CheckoutSession>>,
}

impl StaticGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: CheckoutSession) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(session.id.clone(), session);
        }
    }
}

#[async_trait]
impl PaymentGateway for StaticGateway {
    async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession, GatewayError> {
        self.sessions
            .read()
            .map_err(|_| GatewayError::Unavailable("session table lock poisoned".to_string()))?
            .get(session_id)
            .cloned()
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn spawn_gateway() -> String {
        let app = Router::new().route(
            "/v1/checkout/sessions/{id}",
            get(|Path(id): Path<String>| async move {
                match id.as_str() {
                    "sess_ok" => (
                        axum::http::StatusCode::OK,
                        Json(json!({
                            "id": "sess_ok",
                            "payment_status": "paid",
                            "amount_total": 8000,
                            "metadata": {"customerEmail": "alice@example.com"}
                        })),
                    ),
                    "sess_down" => (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({}))),
                    _ => (axum::http::StatusCode::NOT_FOUND, Json(json!({"error": "no such session"}))),
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_http_gateway_maps_responses() {
        let gateway = HttpPaymentGateway::new(spawn_gateway().await, "sk_test", 5);

        let session = gateway.retrieve_session("sess_ok").await.unwrap();
        assert!(session.is_paid());
        assert_eq!(session.amount_total, Some(8000));
        assert_eq!(session.metadata.get("customerEmail").map(String::as_str), Some("alice@example.com"));

        assert!(matches!(
            gateway.retrieve_session("sess_missing").await,
            Err(GatewayError::SessionNotFound(_))
        ));
        assert!(matches!(
            gateway.retrieve_session("sess_down").await,
            Err(GatewayError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_static_gateway() {
        let gateway = StaticGateway::new();
        gateway.insert(CheckoutSession {
            id: "sess_1".to_string(),
            payment_status: "paid".to_string(),
            ..Default::default()
        });

        assert!(gateway.retrieve_session("sess_1").await.is_ok());
        assert!(gateway.retrieve_session("sess_2").await.is_err());
    }
}
