//! # Application State
//!
//! Shared state for the Axum application.
//! Contains the stores, checkout orchestrator, invoice renderer and configuration.

use checkout_core::{
    BoxedPaymentProvider, CheckoutOrchestrator, CheckoutUrls, Currency, InMemoryCartStore,
    InMemoryOrderStore, InvoiceRenderer, PaymentGatewayAdapter, ProductCatalog, SharedCartStore,
    SharedCatalog, SharedOrderStore,
};
use checkout_stripe::StripeProvider;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Base URL for callbacks
    pub base_url: String,
    /// Environment (development, staging, production)
    pub environment: String,
    /// The one currency the store sells in
    pub currency: Currency,
    /// Products per catalog page
    pub page_size: u64,
    /// Where durable invoice copies are written
    pub invoice_dir: PathBuf,
    /// Interval between retries of failed cart clears
    pub cart_clear_retry: Duration,
}

impl AppConfig {
    /// Load from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let currency = std::env::var("STORE_CURRENCY")
            .unwrap_or_else(|_| "usd".to_string())
            .parse::<Currency>()?;

        let page_size = parse_var("PAGE_SIZE", 5u64)?;
        if page_size == 0 {
            anyhow::bail!("PAGE_SIZE must be at least 1");
        }

        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_var("PORT", 8080)?,
            base_url: std::env::var("BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            currency,
            page_size,
            invoice_dir: std::env::var("INVOICE_DIR")
                .unwrap_or_else(|_| "data/invoices".to_string())
                .into(),
            cart_clear_retry: Duration::from_secs(parse_var("CART_CLEAR_RETRY_SECS", 30)?),
        })
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid socket address {}:{}: {}", self.host, self.port, e))
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            base_url: "http://localhost:8080".to_string(),
            environment: "development".to_string(),
            currency: Currency::USD,
            page_size: 5,
            invoice_dir: PathBuf::from("data/invoices"),
            cart_clear_retry: Duration::from_secs(30),
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}={}: {}", name, raw, e)),
        Err(_) => Ok(default),
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Product catalog
    pub catalog: SharedCatalog,
    /// Cart store
    pub carts: SharedCartStore,
    /// Order store
    pub orders: SharedOrderStore,
    /// Checkout pipeline
    pub checkout: Arc<CheckoutOrchestrator>,
    /// Invoice renderer
    pub invoices: InvoiceRenderer,
    /// Checkout URLs
    pub urls: CheckoutUrls,
    /// Application config
    pub config: Arc<AppConfig>,
    /// Number of products loaded at startup
    pub product_count: usize,
}

impl AppState {
    /// Create a new AppState with the Stripe provider
    pub fn new() -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;
        let catalog = load_product_catalog()?;

        let stripe = StripeProvider::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to initialize Stripe: {}", e))?;

        Ok(Self::with_provider(config, catalog, Arc::new(stripe)))
    }

    /// Assemble state around any payment provider (used by tests)
    pub fn with_provider(config: AppConfig, catalog: ProductCatalog, provider: BoxedPaymentProvider) -> Self {
        let product_count = catalog.products.len();
        let catalog: SharedCatalog = Arc::new(catalog);
        let carts: SharedCartStore = Arc::new(InMemoryCartStore::new());
        let orders: SharedOrderStore = Arc::new(InMemoryOrderStore::new());

        let gateway = PaymentGatewayAdapter::new(provider, config.currency);
        let checkout = Arc::new(CheckoutOrchestrator::new(
            catalog.clone(),
            carts.clone(),
            orders.clone(),
            gateway,
        ));
        let invoices = InvoiceRenderer::new(orders.clone(), config.invoice_dir.clone());

        Self {
            catalog,
            carts,
            orders,
            checkout,
            invoices,
            urls: CheckoutUrls::new(config.base_url.as_str()),
            config: Arc::new(config),
            product_count,
        }
    }

    /// Get the active payment provider's name
    pub fn provider_name(&self) -> &'static str {
        self.checkout.gateway().provider_name()
    }
}

/// Load product catalog from config file
fn load_product_catalog() -> anyhow::Result<ProductCatalog> {
    // Try to load from config/products.toml
    let config_paths = [
        "config/products.toml",
        "../config/products.toml",
        "../../config/products.toml",
    ];

    for path in config_paths {
        if let Ok(content) = std::fs::read_to_string(path) {
            let catalog = ProductCatalog::from_toml(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path, e))?;
            tracing::info!("Loaded {} products from {}", catalog.products.len(), path);
            return Ok(catalog);
        }
    }

    // Return empty catalog if no config found
    tracing::warn!("No product catalog found, using empty catalog");
    Ok(ProductCatalog::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.page_size, 5);
        assert_eq!(config.currency, Currency::USD);
    }

    #[test]
    fn test_socket_addr() {
        let config = AppConfig {
            host: "0.0.0.0".to_string(),
            port: 3000,
            ..AppConfig::default()
        };

        let addr = config.socket_addr().unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:3000");

        let bad = AppConfig {
            host: "not a host".to_string(),
            ..AppConfig::default()
        };
        assert!(bad.socket_addr().is_err());
    }

    #[test]
    fn test_parse_var_default() {
        assert_eq!(parse_var::<u64>("CHECKOUT_API_TEST_UNSET_VAR", 7).unwrap(), 7);
    }

    #[test]
    fn test_bundled_catalog_parses() {
        let content = include_str!("../../../config/products.toml");
        let catalog = ProductCatalog::from_toml(content).unwrap();
        assert!(catalog.active_products().any(|p| p.id.as_str() == "widget"));
        assert!(catalog.active_products().all(|p| p.id.as_str() != "legacy-widget"));
    }
}
