//! # Cart Types
//!
//! Per-user shopping carts and the cart-store collaborator.
//! The cart is the only mutable input to checkout.

use crate::catalog::Catalog;
use crate::error::{ShopError, ShopResult};
use crate::ids::{Identity, ProductId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, instrument};

/// A product reference and quantity in a cart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

/// A user's cart, lines in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub lines: Vec<CartLine>,
}

impl Cart {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Add `quantity` of a product, merging with an existing line
    pub fn add(&mut self, product_id: ProductId, quantity: u32) {
        match self.lines.iter_mut().find(|l| l.product_id == product_id) {
            Some(line) => line.quantity = line.quantity.saturating_add(quantity),
            None => self.lines.push(CartLine {
                product_id,
                quantity,
            }),
        }
    }

    /// Remove a product's line entirely
    pub fn remove(&mut self, product_id: &ProductId) {
        self.lines.retain(|l| &l.product_id != product_id);
    }
}

/// Storage for per-user carts (owned by the session subsystem)
#[async_trait]
pub trait CartStore: Send + Sync {
    async fn get_cart(&self, user_id: &UserId) -> ShopResult<Cart>;

    async fn add_line(&self, user_id: &UserId, product_id: &ProductId, quantity: u32) -> ShopResult<Cart>;

    async fn remove_line(&self, user_id: &UserId, product_id: &ProductId) -> ShopResult<Cart>;

    async fn clear(&self, user_id: &UserId) -> ShopResult<()>;
}

/// Shared cart store handle
pub type SharedCartStore = Arc<dyn CartStore>;

/// Cart store held in process memory
#[derive(Debug, Default)]
pub struct InMemoryCartStore {
    carts: RwLock<HashMap<UserId, Cart>>,
}

impl InMemoryCartStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> ShopError {
    ShopError::PersistenceError("cart store lock poisoned".to_string())
}

#[async_trait]
impl CartStore for InMemoryCartStore {
    async fn get_cart(&self, user_id: &UserId) -> ShopResult<Cart> {
        let carts = self.carts.read().map_err(|_| poisoned())?;
        Ok(carts.get(user_id).cloned().unwrap_or_default())
    }

    async fn add_line(&self, user_id: &UserId, product_id: &ProductId, quantity: u32) -> ShopResult<Cart> {
        let mut carts = self.carts.write().map_err(|_| poisoned())?;
        let cart = carts.entry(user_id.clone()).or_default();
        cart.add(product_id.clone(), quantity);
        Ok(cart.clone())
    }

    async fn remove_line(&self, user_id: &UserId, product_id: &ProductId) -> ShopResult<Cart> {
        let mut carts = self.carts.write().map_err(|_| poisoned())?;
        let cart = carts.entry(user_id.clone()).or_default();
        cart.remove(product_id);
        Ok(cart.clone())
    }

    async fn clear(&self, user_id: &UserId) -> ShopResult<()> {
        let mut carts = self.carts.write().map_err(|_| poisoned())?;
        carts.remove(user_id);
        Ok(())
    }
}

/// Add a catalog product to the requester's cart.
///
/// Unknown or inactive products are rejected with `NotFound`.
#[instrument(skip(catalog, carts, identity), fields(user_id = %identity.user_id))]
pub async fn add_to_cart(
    catalog: &dyn Catalog,
    carts: &dyn CartStore,
    identity: &Identity,
    product_id: &ProductId,
    quantity: u32,
) -> ShopResult<Cart> {
    if quantity == 0 {
        return Err(ShopError::InvalidRequest(
            "quantity must be at least 1".to_string(),
        ));
    }

    match catalog.find_product(product_id).await? {
        Some(product) if product.active => {}
        _ => return Err(ShopError::product_not_found(product_id.as_str())),
    }

    let cart = carts.add_line(&identity.user_id, product_id, quantity).await?;
    debug!("Added {} x {} to cart", quantity, product_id);
    Ok(cart)
}
