//! Settlement error types

use uuid::Uuid;

/// Postgres SQLSTATE for unique constraint violations
const UNIQUE_VIOLATION: &str = "23505";

/// Constraint guarding one order per payment session
const ORDER_SESSION_CONSTRAINT: &str = "orders_payment_session_id_key";

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook event: {0}")]
    MalformedEvent(String),

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Order already exists for payment session {0}")]
    DuplicateOrder(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("Stock for product {product_id} would become negative ({stock})")]
    NegativeStock { product_id: Uuid, stock: i32 },

    #[error("Invalid payout: {0}")]
    InvalidPayout(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Notification channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How the HTTP layer should answer when an event fails with this error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Unverifiable or unparseable delivery; retrying the same bytes cannot succeed
    ClientError,
    /// Processing failed after verification, payload problems included;
    /// the gateway should redeliver
    ServerError,
}

impl SettlementError {
    pub fn status_class(&self) -> StatusClass {
        match self {
            SettlementError::WebhookSignatureInvalid | SettlementError::MalformedEvent(_) => {
                StatusClass::ClientError
            }
            _ => StatusClass::ServerError,
        }
    }
}

impl From<sqlx::Error> for SettlementError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.code().as_deref() == Some(UNIQUE_VIOLATION)
                && db_err.constraint() == Some(ORDER_SESSION_CONSTRAINT)
            {
                return SettlementError::DuplicateOrder(db_err.message().to_string());
            }
        }
        SettlementError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for SettlementError {
    fn from(e: stripe::StripeError) -> Self {
        SettlementError::Gateway(e.to_string())
    }
}

impl From<serde_json::Error> for SettlementError {
    fn from(e: serde_json::Error) -> Self {
        SettlementError::InvalidPayload(e.to_string())
    }
}

pub type SettlementResult<T> = Result<T, SettlementError>;
