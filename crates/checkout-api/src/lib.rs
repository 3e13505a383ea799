//! # checkout-api
//!
//! HTTP API layer for storefront-checkout-rs.
//!
//! This crate provides:
//! - Axum-based HTTP server
//! - REST endpoints for catalog, cart, checkout, orders and invoices
//! - Webhook handlers for payment events
//!
//! Requests identify the user with `x-user-id` and `x-user-email` headers.
//!
//! ## Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/health` | Health check |
//! | GET | `/api/v1/products` | List products |
//! | GET | `/api/v1/products/{id}` | Get product |
//! | GET/POST | `/api/v1/cart` | View / add to cart |
//! | DELETE | `/api/v1/cart/{id}` | Remove from cart |
//! | POST | `/api/v1/checkout` | Open hosted payment session |
//! | GET | `/checkout/success` | Confirm hosted session |
//! | GET/POST | `/api/v1/orders` | List orders / charge and place order |
//! | GET | `/api/v1/orders/{id}/invoice` | Invoice PDF |
//! | POST | `/webhook/stripe` | Stripe webhook |

pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::{AppConfig, AppState};
