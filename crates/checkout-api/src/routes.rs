//! # Routes
//!
//! Axum router configuration for the storefront API.

use crate::handlers;
use crate::state::AppState;
use axum::{
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Create the main application router
///
/// Routes:
/// - Catalog:
///   - GET  /api/v1/products - List products (`?page=`, `?category=`)
///   - GET  /api/v1/products/{product_id} - Get product by ID
///
/// - Cart (requires `x-user-id` / `x-user-email`):
///   - GET    /api/v1/cart - Priced cart
///   - POST   /api/v1/cart - Add a product
///   - DELETE /api/v1/cart/{product_id} - Remove a product
///
/// - Checkout and orders (requires identity):
///   - POST /api/v1/checkout - Open a hosted payment session
///   - POST /api/v1/orders - Charge a token and place the order
///   - GET  /api/v1/orders - List the requester's orders
///   - GET  /api/v1/orders/{order_id}/invoice - Stream the invoice PDF
///
/// - Webhooks:
///   - POST /webhook/stripe - Stripe webhook handler
///
/// - Pages:
///   - GET /checkout/success - Confirms the session, places the order
///   - GET /checkout/cancel - Cancel page
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let checkout_routes = Router::new()
        .route("/success", get(handlers::checkout_success))
        .route("/cancel", get(handlers::checkout_cancel));

    let catalog_routes = Router::new()
        .route("/products", get(handlers::list_products))
        .route("/products/{product_id}", get(handlers::get_product));

    let cart_routes = Router::new()
        .route("/cart", get(handlers::get_cart).post(handlers::add_cart_line))
        .route("/cart/{product_id}", delete(handlers::remove_cart_line));

    let order_routes = Router::new()
        .route("/checkout", post(handlers::create_checkout))
        .route("/orders", post(handlers::create_order).get(handlers::list_orders))
        .route("/orders/{order_id}/invoice", get(handlers::get_invoice));

    let api_routes = Router::new()
        .merge(catalog_routes)
        .merge(cart_routes)
        .merge(order_routes);

    // Webhooks need the raw body for signature checks
    let webhook_routes = Router::new().route("/stripe", post(handlers::stripe_webhook));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/", get(handlers::health))
        .nest("/checkout", checkout_routes)
        .nest("/api/v1", api_routes)
        .nest("/webhook", webhook_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
