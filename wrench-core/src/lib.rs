pub mod models;
pub mod notify;
pub mod payment;
pub mod repository;
pub mod settings;

pub use repository::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    /// Retryable: a concurrent writer holds the key or the write could not
    /// be completed within the attempt budget.
    #[error("Conflict, retry shortly: {0}")]
    Conflict(String),
    #[error("Transient storage error: {0}")]
    TransientStorage(String),
    #[error("Ledger invariant violation: {0}")]
    LedgerInvariantViolation(String),
    #[error("Duplicate: {0}")]
    Duplicate(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Payment gateway error: {0}")]
    GatewayError(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl CoreError {
    /// Whether the caller should retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Conflict(_) | CoreError::TransientStorage(_) | CoreError::GatewayError(_)
        )
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => CoreError::TransientStorage(msg),
            StoreError::UniqueViolation(msg) => CoreError::Conflict(msg),
            StoreError::NotFound(msg) => CoreError::NotFound(msg),
            StoreError::Backend(msg) => CoreError::InternalError(msg),
        }
    }
}

impl From<payment::GatewayError> for CoreError {
    fn from(err: payment::GatewayError) -> Self {
        match err {
            payment::GatewayError::SessionNotFound(id) => CoreError::NotFound(format!("checkout session {}", id)),
            other => CoreError::GatewayError(other.to_string()),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
