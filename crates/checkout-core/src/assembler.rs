//! # Order Assembly
//!
//! Turns a cart snapshot into a persisted order. This is the one step the
//! checkout pipeline must run at most once per attempt.

use crate::error::{ShopError, ShopResult};
use crate::ids::{Identity, OrderId};
use crate::order::{Order, OrderLine, OrderStore, OrderUser, PaymentState};
use crate::snapshot::CartSnapshot;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Builds and persists orders
#[derive(Clone)]
pub struct OrderAssembler {
    orders: Arc<dyn OrderStore>,
}

impl OrderAssembler {
    pub fn new(orders: Arc<dyn OrderStore>) -> Self {
        Self { orders }
    }

    /// Copy snapshot lines into a new order without persisting it
    pub fn build(identity: &Identity, snapshot: &CartSnapshot, payment: PaymentState) -> Order {
        let lines = snapshot
            .lines
            .iter()
            .map(|line| OrderLine {
                product_id: line.product.id.clone(),
                title: line.product.title.clone(),
                description: line.product.description.clone(),
                unit_price: line.product.price,
                quantity: line.quantity,
            })
            .collect();

        Order {
            id: OrderId::generate(),
            user: OrderUser::from(identity),
            lines,
            currency: snapshot.total.currency,
            payment,
            created_at: Utc::now(),
        }
    }

    /// Build and persist an order.
    ///
    /// A `PersistenceError` does not prove the order was not written: the
    /// store may have applied the write before failing.
    #[instrument(skip(self, identity, snapshot), fields(user_id = %identity.user_id, lines = snapshot.lines.len()))]
    pub async fn assemble(
        &self,
        identity: &Identity,
        snapshot: &CartSnapshot,
        payment: PaymentState,
    ) -> ShopResult<Order> {
        if snapshot.is_empty() {
            return Err(ShopError::InvalidRequest(
                "cannot create an order from an empty cart".to_string(),
            ));
        }

        let order = Self::build(identity, snapshot, payment);
        let id = self.orders.save(order.clone()).await.map_err(|e| {
            error!("Failed to persist order {}: {}", order.id, e);
            match e {
                ShopError::PersistenceError(_) => e,
                other => ShopError::PersistenceError(other.to_string()),
            }
        })?;

        info!("Persisted order {} ({} items)", id, order.item_count());
        Ok(Order { id, ..order })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;
    use crate::order::InMemoryOrderStore;
    use crate::product::{Currency, Price, Product};
    use crate::snapshot::SnapshotLine;

    fn snapshot() -> CartSnapshot {
        let widget = Product::new("widget", "Widget", Price::parse("9.99", Currency::USD).unwrap())
            .with_description("A fine widget");
        CartSnapshot::from_lines(
            UserId::new("u1"),
            vec![SnapshotLine {
                product: widget,
                quantity: 3,
            }],
            Currency::USD,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_assemble_copies_lines_and_user() {
        let store = Arc::new(InMemoryOrderStore::new());
        let assembler = OrderAssembler::new(store.clone());
        let identity = Identity::new("u1", "u1@example.com");

        let order = assembler
            .assemble(&identity, &snapshot(), PaymentState::Pending)
            .await
            .unwrap();

        assert_eq!(order.lines.len(), 1);
        assert_eq!(order.lines[0].title, "Widget");
        assert_eq!(order.lines[0].description, "A fine widget");
        assert_eq!(order.lines[0].quantity, 3);
        assert_eq!(order.user.email, "u1@example.com");

        let stored = store.find_by_id(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.total().unwrap(), Price::parse("29.97", Currency::USD).unwrap());
    }

    #[tokio::test]
    async fn test_order_is_decoupled_from_later_price_changes() {
        let store = Arc::new(InMemoryOrderStore::new());
        let assembler = OrderAssembler::new(store.clone());
        let identity = Identity::new("u1", "u1@example.com");

        let mut snapshot = snapshot();
        let order = assembler
            .assemble(&identity, &snapshot, PaymentState::Pending)
            .await
            .unwrap();

        snapshot.lines[0].product.price = Price::parse("99.00", Currency::USD).unwrap();

        let stored = store.find_by_id(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.lines[0].unit_price, Price::parse("9.99", Currency::USD).unwrap());
    }

    #[tokio::test]
    async fn test_empty_snapshot_rejected() {
        let assembler = OrderAssembler::new(Arc::new(InMemoryOrderStore::new()));
        let identity = Identity::new("u1", "u1@example.com");
        let empty = CartSnapshot::from_lines(UserId::new("u1"), Vec::new(), Currency::USD).unwrap();

        let err = assembler
            .assemble(&identity, &empty, PaymentState::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, ShopError::InvalidRequest(_)));
    }
}
