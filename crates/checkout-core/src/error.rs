//! # Checkout Error Types
//!
//! Typed error handling for the storefront checkout engine.
//! Every checkout, cart, order and invoice operation returns `Result<T, ShopError>`.

use thiserror::Error;

/// Core error type for all storefront operations
#[derive(Debug, Error)]
pub enum ShopError {
    /// Product or order does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Resource belongs to another user
    #[error("Not authorized to access this {entity}")]
    Unauthorized { entity: &'static str },

    /// Catalog or cart lookup failed
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// Payment provider could not be reached or failed transiently
    #[error("Payment gateway unavailable [{provider}]: {message}")]
    PaymentGatewayUnavailable { provider: String, message: String },

    /// Order store failed. The write may or may not have been applied.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// Payment was declined by the provider
    #[error("Payment declined: {reason}")]
    PaymentDeclined { reason: String },

    /// Charge request violated an invariant (empty cart, zero amount)
    #[error("Invalid charge request: {0}")]
    InvalidChargeRequest(String),

    /// Invalid request data rejected at the boundary
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration errors (missing keys, invalid config)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Webhook signature verification failed
    #[error("Webhook verification failed: {0}")]
    WebhookVerificationFailed(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShopError {
    /// Shorthand for a missing product
    pub fn product_not_found(id: impl Into<String>) -> Self {
        ShopError::NotFound {
            entity: "product",
            id: id.into(),
        }
    }

    /// Shorthand for a missing order
    pub fn order_not_found(id: impl Into<String>) -> Self {
        ShopError::NotFound {
            entity: "order",
            id: id.into(),
        }
    }

    /// Returns true if this error is a transient infrastructure failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShopError::CatalogUnavailable(_)
                | ShopError::PaymentGatewayUnavailable { .. }
                | ShopError::PersistenceError(_)
        )
    }

    /// Returns the HTTP status code appropriate for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ShopError::NotFound { .. } => 404,
            ShopError::Unauthorized { .. } => 403,
            ShopError::CatalogUnavailable(_) => 503,
            ShopError::PaymentGatewayUnavailable { .. } => 502,
            ShopError::PersistenceError(_) => 500,
            ShopError::PaymentDeclined { .. } => 402,
            ShopError::InvalidChargeRequest(_) => 500,
            ShopError::InvalidRequest(_) => 400,
            ShopError::Configuration(_) => 500,
            ShopError::WebhookVerificationFailed(_) => 401,
            ShopError::Serialization(_) => 500,
            ShopError::Internal(_) => 500,
        }
    }

    /// Message safe to show an end user.
    ///
    /// Infrastructure failures collapse to a generic message; the detailed
    /// `Display` output is for logs only.
    pub fn public_message(&self) -> String {
        match self {
            ShopError::NotFound { .. }
            | ShopError::Unauthorized { .. }
            | ShopError::PaymentDeclined { .. }
            | ShopError::InvalidRequest(_)
            | ShopError::WebhookVerificationFailed(_) => self.to_string(),
            ShopError::CatalogUnavailable(_)
            | ShopError::PaymentGatewayUnavailable { .. }
            | ShopError::PersistenceError(_) => {
                "The service is temporarily unavailable, please try again".to_string()
            }
            _ => "Something went wrong".to_string(),
        }
    }
}

/// Result type alias for storefront operations
pub type ShopResult<T> = Result<T, ShopError>;
