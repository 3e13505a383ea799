//! # Payment Gateway
//!
//! The provider trait implemented by payment backends, and the adapter the
//! checkout pipeline talks to.
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │              PaymentGatewayAdapter                │
//! │  snapshot ──► ChargeRequest (ceil to cents)       │
//! │  provider errors ──► ShopError taxonomy           │
//! └───────────────────────────┬───────────────────────┘
//!                             │
//!               ┌─────────────┴─────────────┐
//!               │ PaymentProvider (trait)   │
//!               │  ├── create_session()     │
//!               │  ├── session_status()     │
//!               │  ├── charge()             │
//!               │  └── verify_webhook()     │
//!               └─────────────▲─────────────┘
//!                             │
//!                   ┌─────────┴─────────┐
//!                   │  StripeProvider   │
//!                   └───────────────────┘
//! ```

use crate::error::{ShopError, ShopResult};
use crate::payment::{
    ChargeConfirmation, CheckoutSession, CheckoutUrls, PaymentToken, SessionStatus, WebhookEvent,
};
use crate::product::Currency;
use crate::snapshot::CartSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// One line of a charge, priced in the smallest currency unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeLine {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub unit_amount: i64,
    pub quantity: u32,
}

/// Provider-agnostic charge / session request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub currency: Currency,
    pub lines: Vec<ChargeLine>,
    /// `Σ unit_amount * quantity`, smallest currency unit
    pub amount: i64,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ChargeRequest {
    /// Translate snapshot lines into a charge request.
    ///
    /// Unit amounts are rounded up to the smallest currency unit and the
    /// total is derived from the rounded units, so hosted sessions and
    /// direct charges always agree on the amount.
    pub fn from_snapshot(snapshot: &CartSnapshot, currency: Currency) -> ShopResult<Self> {
        if snapshot.is_empty() {
            return Err(ShopError::InvalidChargeRequest(
                "charge request has no line items".to_string(),
            ));
        }

        let mut lines = Vec::with_capacity(snapshot.lines.len());
        let mut amount: i64 = 0;

        for line in &snapshot.lines {
            if line.quantity == 0 {
                return Err(ShopError::InvalidChargeRequest(format!(
                    "line for {} has zero quantity",
                    line.product.id
                )));
            }
            if line.product.price.currency != currency {
                return Err(ShopError::InvalidChargeRequest(format!(
                    "line for {} is priced in {}, store charges in {}",
                    line.product.id, line.product.price.currency, currency
                )));
            }

            let unit_amount = line.product.price.to_smallest_unit_ceil()?;
            if unit_amount < 0 {
                return Err(ShopError::InvalidChargeRequest(format!(
                    "line for {} has a negative price",
                    line.product.id
                )));
            }

            amount = unit_amount
                .checked_mul(i64::from(line.quantity))
                .and_then(|line_amount| amount.checked_add(line_amount))
                .ok_or_else(|| ShopError::InvalidChargeRequest("charge amount overflow".to_string()))?;

            lines.push(ChargeLine {
                name: line.product.title.clone(),
                description: Some(line.product.description.clone()).filter(|d| !d.is_empty()),
                unit_amount,
                quantity: line.quantity,
            });
        }

        if amount <= 0 {
            return Err(ShopError::InvalidChargeRequest(format!(
                "charge amount must be positive, got {}",
                amount
            )));
        }

        Ok(Self {
            currency,
            lines,
            amount,
            description: format!("Order of {} item(s)", snapshot.total_quantity),
            customer_email: None,
            idempotency_key: None,
            metadata: BTreeMap::new(),
        })
    }

    /// Builder: prefill the customer email
    pub fn with_customer_email(mut self, email: impl Into<String>) -> Self {
        self.customer_email = Some(email.into());
        self
    }

    /// Builder: set idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Builder: add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Core trait for payment provider implementations.
///
/// Implementations report failures using the shared taxonomy:
/// `PaymentDeclined` for customer-facing declines,
/// `PaymentGatewayUnavailable` for transport and 5xx failures, and
/// `InvalidChargeRequest` when the provider rejects the request itself.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a hosted checkout session. No money moves yet.
    async fn create_session(
        &self,
        request: &ChargeRequest,
        urls: &CheckoutUrls,
    ) -> ShopResult<CheckoutSession>;

    /// Look up whether a hosted session has been paid
    async fn session_status(&self, session_id: &str) -> ShopResult<SessionStatus>;

    /// Charge a client-supplied token synchronously
    async fn charge(
        &self,
        request: &ChargeRequest,
        token: &PaymentToken,
    ) -> ShopResult<ChargeConfirmation>;

    /// Verify a webhook signature and parse the event
    async fn verify_webhook(&self, payload: &[u8], signature: &str) -> ShopResult<WebhookEvent>;

    /// Get the provider name (for logging and routing)
    fn provider_name(&self) -> &'static str;

    /// Get the webhook endpoint path for this provider.
    /// Default: `/webhook/{provider_name}`
    fn webhook_path(&self) -> String {
        format!("/webhook/{}", self.provider_name())
    }
}

/// Type alias for a shared payment provider (dynamic dispatch)
pub type BoxedPaymentProvider = Arc<dyn PaymentProvider>;

/// Wraps a provider with request construction and error normalization
#[derive(Clone)]
pub struct PaymentGatewayAdapter {
    provider: BoxedPaymentProvider,
    currency: Currency,
}

impl PaymentGatewayAdapter {
    pub fn new(provider: BoxedPaymentProvider, currency: Currency) -> Self {
        Self { provider, currency }
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }

    /// Build a validated charge request from a snapshot
    pub fn charge_request(&self, snapshot: &CartSnapshot) -> ShopResult<ChargeRequest> {
        ChargeRequest::from_snapshot(snapshot, self.currency)
    }

    /// Open a hosted session (session-first flow)
    #[instrument(skip(self, request, urls), fields(provider = self.provider_name(), amount = request.amount))]
    pub async fn open_session(
        &self,
        request: &ChargeRequest,
        urls: &CheckoutUrls,
    ) -> ShopResult<CheckoutSession> {
        let session = self
            .provider
            .create_session(request, urls)
            .await
            .map_err(|e| self.normalize(e))?;
        debug!("Opened session {}", session.session_id);
        Ok(session)
    }

    /// Ask the provider whether a hosted session was paid
    pub async fn session_status(&self, session_id: &str) -> ShopResult<SessionStatus> {
        self.provider
            .session_status(session_id)
            .await
            .map_err(|e| self.normalize(e))
    }

    /// Charge a token (charge-first flow)
    #[instrument(skip(self, request, token), fields(provider = self.provider_name(), amount = request.amount))]
    pub async fn charge(
        &self,
        request: &ChargeRequest,
        token: &PaymentToken,
    ) -> ShopResult<ChargeConfirmation> {
        self.provider
            .charge(request, token)
            .await
            .map_err(|e| self.normalize(e))
    }

    /// Verify and parse a provider webhook
    pub async fn verify_webhook(&self, payload: &[u8], signature: &str) -> ShopResult<WebhookEvent> {
        self.provider.verify_webhook(payload, signature).await
    }

    /// Fold anything outside the gateway taxonomy into `PaymentGatewayUnavailable`
    fn normalize(&self, err: ShopError) -> ShopError {
        match err {
            ShopError::PaymentDeclined { .. }
            | ShopError::PaymentGatewayUnavailable { .. }
            | ShopError::InvalidChargeRequest(_)
            | ShopError::NotFound { .. } => err,
            other => {
                warn!("Normalizing provider error: {}", other);
                ShopError::PaymentGatewayUnavailable {
                    provider: self.provider_name().to_string(),
                    message: other.to_string(),
                }
            }
        }
    }
}
