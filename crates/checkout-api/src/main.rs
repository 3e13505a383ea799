//! # Storefront Checkout
//!
//! Checkout, order and invoice service.
//!
//! ## Usage
//!
//! ```bash
//! # Set environment variables
//! export STRIPE_SECRET_KEY=sk_test_...
//! export STRIPE_PUBLISHABLE_KEY=pk_test_...
//! export STRIPE_WEBHOOK_SECRET=whsec_...
//!
//! # Run the server
//! storefront-checkout
//! ```

use checkout_api::{routes, state::AppState};
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    print_banner();

    let state = AppState::new()?;

    let addr = state.config.socket_addr()?;
    let is_prod = state.config.is_production();

    info!("Environment: {}", state.config.environment);
    info!("Products loaded: {}", state.product_count);
    info!("Payment provider: {}", state.provider_name());
    info!("Invoices written to {}", state.config.invoice_dir.display());

    // Carts that failed to clear after an order are retried in the background
    let checkout = Arc::clone(&state.checkout);
    let retry_every = state.config.cart_clear_retry;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(retry_every);
        loop {
            ticker.tick().await;
            let cleared = checkout.retry_pending_cart_clears().await;
            if cleared > 0 {
                info!("Cleared {} pending cart(s)", cleared);
            } else {
                debug!("No pending cart clears");
            }
        }
    });

    let app = routes::create_router(state);

    info!("🛒 Storefront checkout starting on http://{}", addr);

    if !is_prod {
        info!("📝 Health: http://{}/health", addr);
        info!("💳 Checkout: POST http://{}/api/v1/checkout", addr);
        info!("🔔 Webhook: POST http://{}/webhook/stripe", addr);
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  🛒 Storefront Checkout 🛒
  ━━━━━━━━━━━━━━━━━━━━━━━━━
  Orders, payments, invoices
  Version: {}
  
"#,
        env!("CARGO_PKG_VERSION")
    );
}
