//! # Product Catalog
//!
//! The catalog collaborator interface and the in-memory catalog
//! seeded from `config/products.toml`.

use crate::error::ShopResult;
use crate::ids::ProductId;
use crate::page::{Page, PageRequest};
use crate::product::Product;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Filter applied when listing products
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFilter {
    #[serde(default)]
    pub category: Option<String>,
}

impl ProductFilter {
    pub fn category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
        }
    }

    fn matches(&self, product: &Product) -> bool {
        match &self.category {
            Some(category) => product.category.as_deref() == Some(category.as_str()),
            None => true,
        }
    }
}

/// Read access to product records.
///
/// Lookup errors surface as `ShopError::CatalogUnavailable`; a missing
/// product is `Ok(None)`.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Find a product by id
    async fn find_product(&self, id: &ProductId) -> ShopResult<Option<Product>>;

    /// List active products matching `filter`, one page at a time
    async fn list_products(
        &self,
        filter: &ProductFilter,
        page: PageRequest,
    ) -> ShopResult<Page<Product>>;
}

/// Shared catalog handle
pub type SharedCatalog = Arc<dyn Catalog>;

/// Product catalog held in memory (loaded from config)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductCatalog {
    pub products: Vec<Product>,
}

impl ProductCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self {
            products: Vec::new(),
        }
    }

    /// Add a product to the catalog
    pub fn add(&mut self, product: Product) {
        self.products.push(product);
    }

    /// Builder: add a product
    pub fn with_product(mut self, product: Product) -> Self {
        self.add(product);
        self
    }

    /// Find a product by ID
    pub fn get(&self, id: &ProductId) -> Option<&Product> {
        self.products.iter().find(|p| &p.id == id)
    }

    /// Get all active products
    pub fn active_products(&self) -> impl Iterator<Item = &Product> {
        self.products.iter().filter(|p| p.active)
    }

    /// Load catalog from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }
}

#[async_trait]
impl Catalog for ProductCatalog {
    async fn find_product(&self, id: &ProductId) -> ShopResult<Option<Product>> {
        Ok(self.get(id).cloned())
    }

    async fn list_products(
        &self,
        filter: &ProductFilter,
        page: PageRequest,
    ) -> ShopResult<Page<Product>> {
        let matching: Vec<Product> = self
            .active_products()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        Ok(Page::from_slice(&matching, page))
    }
}
