//! # checkout-stripe
//!
//! Stripe payment provider for storefront-checkout-rs.
//!
//! `StripeProvider` implements `checkout_core::PaymentProvider` with two modes:
//!
//! 1. **Hosted sessions** - Checkout Sessions API
//!    - Dynamic line items priced from the cart snapshot
//!    - Customer email prefill
//!    - Session status lookup for success callbacks
//!
//! 2. **Direct charges** - Charges API
//!    - Client-side token (`tok_...`)
//!    - Order id carried in charge metadata
//!    - Idempotency key on every request
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use checkout_core::{Currency, PaymentGatewayAdapter};
//! use checkout_stripe::StripeProvider;
//! use std::sync::Arc;
//!
//! let provider = StripeProvider::from_env()?;
//! let gateway = PaymentGatewayAdapter::new(Arc::new(provider), Currency::USD);
//! ```
//!
//! ## Webhook Handling
//!
//! ```rust,ignore
//! let event = gateway.verify_webhook(payload, signature).await?;
//! if event.is_paid_checkout() {
//!     orchestrator.confirm_session_from_provider(event.session_id.as_deref().unwrap_or_default()).await?;
//! }
//! ```

pub mod config;
pub mod provider;
pub mod webhook;

// Re-exports
pub use config::StripeConfig;
pub use provider::StripeProvider;
pub use webhook::{sign_payload, verify_signature, REQUIRED_WEBHOOK_EVENTS};
