//! # Payment Types
//!
//! Provider-agnostic session, charge and webhook types exchanged with
//! payment providers.

use crate::error::{ShopError, ShopResult};
use crate::product::Currency;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Client-supplied payment token for direct charges (e.g. `tok_visa`)
#[derive(Clone, PartialEq, Eq)]
pub struct PaymentToken(String);

impl PaymentToken {
    /// Validate and wrap a token
    pub fn parse(token: impl Into<String>) -> ShopResult<Self> {
        let token = token.into();
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Err(ShopError::InvalidRequest(
                "payment token is required".to_string(),
            ));
        }
        if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ShopError::InvalidRequest(
                "payment token is malformed".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens are card-equivalent; keep them out of logs.
impl std::fmt::Debug for PaymentToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PaymentToken(..)")
    }
}

/// Where the hosted payment page sends the customer afterwards
#[derive(Debug, Clone)]
pub struct CheckoutUrls {
    /// Base URL of the application (e.g., "https://shop.example.com")
    pub base_url: String,
    /// Success page path
    pub success_path: String,
    /// Cancel page path
    pub cancel_path: String,
}

impl CheckoutUrls {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            success_path: "/checkout/success".to_string(),
            cancel_path: "/checkout/cancel".to_string(),
        }
    }

    /// Success URL with the provider's session id placeholder appended
    pub fn success_url(&self) -> String {
        format!(
            "{}{}?session_id={{CHECKOUT_SESSION_ID}}",
            self.base_url, self.success_path
        )
    }

    pub fn cancel_url(&self) -> String {
        format!("{}{}", self.base_url, self.cancel_path)
    }
}

impl Default for CheckoutUrls {
    fn default() -> Self {
        Self::new("http://localhost:8080")
    }
}

/// A hosted checkout session created by a payment provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Provider's session ID
    pub session_id: String,

    /// Provider name (e.g., "stripe")
    pub provider: String,

    /// URL to redirect customer to for payment
    pub checkout_url: String,

    /// Amount the session will collect, smallest currency unit
    pub amount_total: i64,

    /// When the session expires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Payment state of a hosted session, as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    /// Awaiting payment
    Open,
    /// Payment collected
    Paid {
        amount_total: Option<i64>,
        payment_intent_id: Option<String>,
    },
    /// Session expired without payment
    Expired,
}

/// Confirmation of a completed direct charge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeConfirmation {
    /// Provider's charge id (e.g., "ch_...")
    pub charge_id: String,
    pub provider: String,
    /// Amount charged, smallest currency unit
    pub amount: i64,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

/// Webhook event types we care about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    /// Checkout session completed
    CheckoutCompleted,
    /// Checkout session expired
    CheckoutExpired,
    /// Payment succeeded
    PaymentSucceeded,
    /// Payment failed
    PaymentFailed,
    /// Unknown event (passthrough)
    Unknown(String),
}

/// A verified webhook event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Event ID from provider
    pub event_id: String,

    /// Event type
    pub event_type: WebhookEventType,

    /// Provider name
    pub provider: String,

    /// Related session ID (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Related payment intent ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,

    /// Amount paid (in smallest unit)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_paid: Option<i64>,

    /// Provider-reported payment status (e.g., "paid")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl WebhookEvent {
    /// True for a completed session whose payment was collected
    pub fn is_paid_checkout(&self) -> bool {
        self.event_type == WebhookEventType::CheckoutCompleted
            && self.payment_status.as_deref() == Some("paid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_urls() {
        let urls = CheckoutUrls::new("https://shop.example.com/");

        assert_eq!(
            urls.success_url(),
            "https://shop.example.com/checkout/success?session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(urls.cancel_url(), "https://shop.example.com/checkout/cancel");
    }

    #[test]
    fn test_payment_token_validation() {
        assert_eq!(PaymentToken::parse(" tok_visa ").unwrap().as_str(), "tok_visa");
        assert!(PaymentToken::parse("   ").is_err());
        assert!(PaymentToken::parse("tok visa").is_err());
        assert_eq!(format!("{:?}", PaymentToken::parse("tok_visa").unwrap()), "PaymentToken(..)");
    }

    #[test]
    fn test_paid_checkout_detection() {
        let event = WebhookEvent {
            event_id: "evt_1".to_string(),
            event_type: WebhookEventType::CheckoutCompleted,
            provider: "stripe".to_string(),
            session_id: Some("cs_1".to_string()),
            payment_intent_id: None,
            amount_paid: Some(2997),
            payment_status: Some("paid".to_string()),
            timestamp: Utc::now(),
        };
        assert!(event.is_paid_checkout());

        let unpaid = WebhookEvent {
            payment_status: Some("unpaid".to_string()),
            ..event
        };
        assert!(!unpaid.is_paid_checkout());
    }
}
