//! # Order Types
//!
//! Immutable order records and the order-store collaborator.
//! Order lines are structural copies of product data taken at checkout,
//! so later catalog edits never rewrite history.

use crate::error::{ShopError, ShopResult};
use crate::ids::{Identity, OrderId, ProductId, UserId};
use crate::product::{Currency, Price};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A purchased product as it was at order time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub title: String,
    pub description: String,
    pub unit_price: Price,
    pub quantity: u32,
}

impl OrderLine {
    /// Calculate the total price for this line
    pub fn total(&self) -> ShopResult<Price> {
        self.unit_price.checked_times(self.quantity)
    }
}

/// The user an order is bound to, captured at creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderUser {
    pub id: UserId,
    pub email: String,
}

impl From<&Identity> for OrderUser {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.user_id.clone(),
            email: identity.email.clone(),
        }
    }
}

/// Payment status of an order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PaymentState {
    /// Order persisted, charge not confirmed
    Pending,
    /// Provider confirmed payment
    Paid { reference: String },
    /// Zero-total order, nothing to charge
    NotRequired,
    /// Charge attempt failed; order kept for reconciliation
    Failed { reason: String },
}

impl PaymentState {
    pub fn is_settled(&self) -> bool {
        matches!(self, PaymentState::Paid { .. } | PaymentState::NotRequired)
    }
}

/// A persisted order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user: OrderUser,
    pub lines: Vec<OrderLine>,
    pub currency: Currency,
    pub payment: PaymentState,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Recompute the order total from its lines
    pub fn total(&self) -> ShopResult<Price> {
        self.lines
            .iter()
            .try_fold(Price::zero(self.currency), |acc, line| acc.checked_add(&line.total()?))
    }

    /// Get item count
    pub fn item_count(&self) -> u64 {
        self.lines.iter().map(|l| u64::from(l.quantity)).sum()
    }

    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        &self.user.id == user_id
    }
}

/// Durable order storage
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persist a new order and return its id
    async fn save(&self, order: Order) -> ShopResult<OrderId>;

    async fn find_by_id(&self, id: &OrderId) -> ShopResult<Option<Order>>;

    /// Orders owned by a user, oldest first
    async fn list_by_user(&self, user_id: &UserId) -> ShopResult<Vec<Order>>;

    /// Advance the payment state of an existing order.
    ///
    /// Lines and user binding are never touched.
    async fn record_payment(&self, id: &OrderId, payment: PaymentState) -> ShopResult<()>;
}

/// Shared order store handle
pub type SharedOrderStore = Arc<dyn OrderStore>;

/// Order store held in process memory
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<Vec<Order>>,
    index: RwLock<HashMap<OrderId, usize>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored orders
    pub fn len(&self) -> usize {
        self.orders.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> ShopError {
    ShopError::PersistenceError("order store lock poisoned".to_string())
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn save(&self, order: Order) -> ShopResult<OrderId> {
        let mut orders = self.orders.write().map_err(|_| poisoned())?;
        let mut index = self.index.write().map_err(|_| poisoned())?;

        if index.contains_key(&order.id) {
            return Err(ShopError::PersistenceError(format!(
                "duplicate order id {}",
                order.id
            )));
        }

        let id = order.id.clone();
        index.insert(id.clone(), orders.len());
        orders.push(order);
        Ok(id)
    }

    async fn find_by_id(&self, id: &OrderId) -> ShopResult<Option<Order>> {
        let orders = self.orders.read().map_err(|_| poisoned())?;
        let index = self.index.read().map_err(|_| poisoned())?;
        Ok(index.get(id).and_then(|&i| orders.get(i)).cloned())
    }

    async fn list_by_user(&self, user_id: &UserId) -> ShopResult<Vec<Order>> {
        let orders = self.orders.read().map_err(|_| poisoned())?;
        Ok(orders.iter().filter(|o| o.is_owned_by(user_id)).cloned().collect())
    }

    async fn record_payment(&self, id: &OrderId, payment: PaymentState) -> ShopResult<()> {
        let mut orders = self.orders.write().map_err(|_| poisoned())?;
        let index = self.index.read().map_err(|_| poisoned())?;
        let order = index
            .get(id)
            .and_then(|&i| orders.get_mut(i))
            .ok_or_else(|| ShopError::order_not_found(id.as_str()))?;
        order.payment = payment;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd(amount: &str) -> Price {
        Price::parse(amount, Currency::USD).unwrap()
    }

    fn order(user: &str) -> Order {
        Order {
            id: OrderId::generate(),
            user: OrderUser {
                id: UserId::new(user),
                email: format!("{}@example.com", user),
            },
            lines: vec![
                OrderLine {
                    product_id: ProductId::new("p1"),
                    title: "Product 1".to_string(),
                    description: String::new(),
                    unit_price: usd("10.00"),
                    quantity: 2,
                },
                OrderLine {
                    product_id: ProductId::new("p2"),
                    title: "Product 2".to_string(),
                    description: String::new(),
                    unit_price: usd("25.00"),
                    quantity: 1,
                },
            ],
            currency: Currency::USD,
            payment: PaymentState::Pending,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_order_total() {
        let order = order("u1");
        assert_eq!(order.total().unwrap(), usd("45.00"));
        assert_eq!(order.item_count(), 3);
    }

    #[tokio::test]
    async fn test_store_save_find_list() {
        let store = InMemoryOrderStore::new();
        let first = store.save(order("u1")).await.unwrap();
        store.save(order("u2")).await.unwrap();
        let third = store.save(order("u1")).await.unwrap();

        let mine = store.list_by_user(&UserId::new("u1")).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].id, first);
        assert_eq!(mine[1].id, third);

        assert!(store.find_by_id(&OrderId::new("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_payment_keeps_lines() {
        let store = InMemoryOrderStore::new();
        let original = order("u1");
        let id = store.save(original.clone()).await.unwrap();

        store
            .record_payment(&id, PaymentState::Paid { reference: "ch_1".into() })
            .await
            .unwrap();

        let stored = store.find_by_id(&id).await.unwrap().unwrap();
        assert!(stored.payment.is_settled());
        assert_eq!(stored.lines, original.lines);
        assert_eq!(stored.user, original.user);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = InMemoryOrderStore::new();
        let order = order("u1");
        store.save(order.clone()).await.unwrap();
        assert!(store.save(order).await.is_err());
    }
}
