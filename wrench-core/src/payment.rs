use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The gateway's view of a completed (or abandoned) checkout
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub payment_status: String,
    /// Captured amount in pence
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    /// Gateway metadata is a flat string map
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl CheckoutSession {
    pub fn is_paid(&self) -> bool {
        self.payment_status == "paid" || self.payment_status == "no_payment_required"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("checkout session not found: {0}")]
    SessionNotFound(String),
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Fetch a checkout session by id
    async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession, GatewayError>;
}
