//! # checkout-core
//!
//! Core types, traits and the checkout pipeline for the storefront.
//!
//! This crate provides:
//! - `CartSnapshot` for pricing a cart against the catalog
//! - `PaymentProvider` and `PaymentGatewayAdapter` for talking to payment providers
//! - `OrderAssembler` for turning a snapshot into a persisted `Order`
//! - `CheckoutOrchestrator` for the session-first and charge-first checkout flows
//! - `InvoiceRenderer` for PDF invoices written to disk and streamed at once
//! - `ShopError` for typed error handling
//!
//! ## Example
//!
//! ```rust,ignore
//! use checkout_core::{CheckoutOrchestrator, CheckoutOutcome, Identity, PaymentToken};
//!
//! let orchestrator = CheckoutOrchestrator::new(catalog, carts, orders, gateway);
//! let identity = Identity::new("user-1", "user@example.com");
//!
//! let report = orchestrator
//!     .checkout_with_token(&identity, &PaymentToken::parse("tok_visa")?, None)
//!     .await?;
//!
//! if let CheckoutOutcome::Completed(done) = report.outcome {
//!     println!("order {}", done.order_id);
//! }
//! ```

pub mod assembler;
pub mod cart;
pub mod catalog;
pub mod checkout;
pub mod error;
pub mod gateway;
pub mod ids;
pub mod invoice;
pub mod order;
pub mod page;
pub mod payment;
pub mod pdf;
pub mod product;
pub mod snapshot;

// Re-exports for convenience
pub use assembler::OrderAssembler;
pub use cart::{add_to_cart, Cart, CartLine, CartStore, InMemoryCartStore, SharedCartStore};
pub use catalog::{Catalog, ProductCatalog, ProductFilter, SharedCatalog};
pub use checkout::{
    CheckoutFailure, CheckoutOrchestrator, CheckoutOutcome, CheckoutReport, CheckoutResult,
    CheckoutStage, CompletedCheckout,
};
pub use error::{ShopError, ShopResult};
pub use gateway::{
    BoxedPaymentProvider, ChargeLine, ChargeRequest, PaymentGatewayAdapter, PaymentProvider,
};
pub use ids::{Identity, OrderId, ProductId, UserId};
pub use invoice::{
    deliver, invoice_file_name, render_invoice, ChannelSink, DeliveryReport, FileSink,
    InvoiceRenderer, InvoiceSink, InvoiceStream, SinkOutcome,
};
pub use order::{
    InMemoryOrderStore, Order, OrderLine, OrderStore, OrderUser, PaymentState, SharedOrderStore,
};
pub use page::{Page, PageRequest};
pub use payment::{
    ChargeConfirmation, CheckoutSession, CheckoutUrls, PaymentToken, SessionStatus, WebhookEvent,
    WebhookEventType,
};
pub use product::{Currency, Price, Product};
pub use snapshot::{CartSnapshot, SnapshotLine};
