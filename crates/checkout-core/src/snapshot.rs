//! # Cart Snapshots
//!
//! A snapshot resolves a user's cart against the catalog and prices it.
//! Everything downstream of the cart (payment, orders) works from a
//! snapshot, never from the live cart.

use crate::cart::CartStore;
use crate::catalog::Catalog;
use crate::error::{ShopError, ShopResult};
use crate::ids::{ProductId, UserId};
use crate::product::{Currency, Price, Product};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{instrument, warn};

/// A cart line resolved to its product record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotLine {
    pub product: Product,
    pub quantity: u32,
}

impl SnapshotLine {
    /// Unit price times quantity
    pub fn line_total(&self) -> ShopResult<Price> {
        self.product.price.checked_times(self.quantity)
    }
}

/// Immutable, priced copy of a cart at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartSnapshot {
    pub user_id: UserId,
    pub lines: Vec<SnapshotLine>,
    pub total_quantity: u64,
    pub total: Price,
    /// Cart entries dropped because the product no longer exists
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<ProductId>,
}

impl CartSnapshot {
    /// Read the user's cart and resolve it against the catalog.
    ///
    /// Products that no longer exist are dropped. Store or catalog failures
    /// surface as `CatalogUnavailable`.
    #[instrument(skip(catalog, carts), fields(user_id = %user_id))]
    pub async fn take(
        catalog: &dyn Catalog,
        carts: &dyn CartStore,
        user_id: &UserId,
        currency: Currency,
    ) -> ShopResult<Self> {
        let cart = carts
            .get_cart(user_id)
            .await
            .map_err(|e| ShopError::CatalogUnavailable(format!("cart read failed: {}", e)))?;

        let mut lines = Vec::with_capacity(cart.lines.len());
        let mut missing = Vec::new();

        for line in cart.lines {
            let product = catalog
                .find_product(&line.product_id)
                .await
                .map_err(|e| match e {
                    ShopError::CatalogUnavailable(_) => e,
                    other => ShopError::CatalogUnavailable(other.to_string()),
                })?;

            match product {
                Some(product) => lines.push(SnapshotLine {
                    product,
                    quantity: line.quantity,
                }),
                None => {
                    warn!("Dropping cart line for missing product {}", line.product_id);
                    missing.push(line.product_id);
                }
            }
        }

        let mut snapshot = Self::from_lines(user_id.clone(), lines, currency)?;
        snapshot.missing = missing;
        Ok(snapshot)
    }

    /// Build a snapshot from already-resolved lines, computing totals
    pub fn from_lines(user_id: UserId, lines: Vec<SnapshotLine>, currency: Currency) -> ShopResult<Self> {
        let mut total = Price::zero(currency);
        let mut total_quantity: u64 = 0;

        for line in &lines {
            total = total.checked_add(&line.line_total()?)?;
            total_quantity += u64::from(line.quantity);
        }

        Ok(Self {
            user_id,
            lines,
            total_quantity,
            total,
            missing: Vec::new(),
        })
    }

    /// True when no line resolved
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Stable digest of the priced lines.
    ///
    /// Two snapshots with the same products, prices and quantities in the
    /// same order share a fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.user_id.as_str().as_bytes());
        for line in &self.lines {
            hasher.update(b"\n");
            hasher.update(line.product.id.as_str().as_bytes());
            hasher.update(b"|");
            hasher.update(line.product.price.amount.normalize().to_string().as_bytes());
            hasher.update(b"|");
            hasher.update(line.quantity.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::InMemoryCartStore;
    use crate::catalog::{ProductCatalog, ProductFilter};
    use crate::page::{Page, PageRequest};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    fn usd(amount: &str) -> Price {
        Price::parse(amount, Currency::USD).unwrap()
    }

    fn catalog() -> ProductCatalog {
        ProductCatalog::new()
            .with_product(Product::new("widget", "Widget", usd("9.99")))
            .with_product(Product::new("gadget", "Gadget", usd("0.10")))
    }

    struct BrokenCatalog;

    #[async_trait]
    impl Catalog for BrokenCatalog {
        async fn find_product(&self, _id: &ProductId) -> ShopResult<Option<Product>> {
            Err(ShopError::Internal("connection reset".to_string()))
        }

        async fn list_products(&self, _filter: &ProductFilter, _page: PageRequest) -> ShopResult<Page<Product>> {
            Err(ShopError::Internal("connection reset".to_string()))
        }
    }

    #[tokio::test]
    async fn test_snapshot_totals() {
        let carts = InMemoryCartStore::new();
        let user = UserId::new("u1");
        carts.add_line(&user, &ProductId::new("widget"), 3).await.unwrap();
        carts.add_line(&user, &ProductId::new("gadget"), 3).await.unwrap();

        let snapshot = CartSnapshot::take(&catalog(), &carts, &user, Currency::USD)
            .await
            .unwrap();

        assert_eq!(snapshot.lines.len(), 2);
        assert_eq!(snapshot.total_quantity, 6);
        assert_eq!(snapshot.total, usd("30.27"));
    }

    #[tokio::test]
    async fn test_snapshot_drops_missing_products() {
        let carts = InMemoryCartStore::new();
        let user = UserId::new("u1");
        carts.add_line(&user, &ProductId::new("discontinued"), 1).await.unwrap();
        carts.add_line(&user, &ProductId::new("widget"), 1).await.unwrap();

        let snapshot = CartSnapshot::take(&catalog(), &carts, &user, Currency::USD)
            .await
            .unwrap();

        assert_eq!(snapshot.lines.len(), 1);
        assert_eq!(snapshot.missing, vec![ProductId::new("discontinued")]);
        assert_eq!(snapshot.total, usd("9.99"));
    }

    #[tokio::test]
    async fn test_empty_cart_is_a_zero_snapshot() {
        let carts = InMemoryCartStore::new();
        let snapshot = CartSnapshot::take(&catalog(), &carts, &UserId::new("nobody"), Currency::USD)
            .await
            .unwrap();

        assert!(snapshot.is_empty());
        assert!(snapshot.total.is_zero());
        assert_eq!(snapshot.total_quantity, 0);
    }

    #[tokio::test]
    async fn test_catalog_failure_is_catalog_unavailable() {
        let carts = InMemoryCartStore::new();
        let user = UserId::new("u1");
        carts.add_line(&user, &ProductId::new("widget"), 1).await.unwrap();

        let err = CartSnapshot::take(&BrokenCatalog, &carts, &user, Currency::USD)
            .await
            .unwrap_err();
        assert!(matches!(err, ShopError::CatalogUnavailable(_)));
    }

    #[test]
    fn test_fingerprint_tracks_contents() {
        let user = UserId::new("u1");
        let line = |qty| SnapshotLine {
            product: Product::new("widget", "Widget", usd("9.99")),
            quantity: qty,
        };

        let a = CartSnapshot::from_lines(user.clone(), vec![line(1)], Currency::USD).unwrap();
        let b = CartSnapshot::from_lines(user.clone(), vec![line(1)], Currency::USD).unwrap();
        let c = CartSnapshot::from_lines(user, vec![line(2)], Currency::USD).unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    proptest! {
        #[test]
        fn prop_total_is_exact_and_stable(
            lines in proptest::collection::vec((1i64..1_000_000, 1u32..50), 0..20)
        ) {
            let snapshot_lines: Vec<SnapshotLine> = lines
                .iter()
                .enumerate()
                .map(|(i, (cents, qty))| SnapshotLine {
                    product: Product::new(
                        format!("p{}", i),
                        format!("P{}", i),
                        Price::from_smallest_unit(*cents, Currency::USD),
                    ),
                    quantity: *qty,
                })
                .collect();

            let expected_cents: i64 = lines.iter().map(|(cents, qty)| cents * i64::from(*qty)).sum();

            let first = CartSnapshot::from_lines(UserId::new("u"), snapshot_lines.clone(), Currency::USD).unwrap();
            let second = CartSnapshot::from_lines(UserId::new("u"), snapshot_lines, Currency::USD).unwrap();

            prop_assert_eq!(first.total.amount, Decimal::new(expected_cents, 2));
            prop_assert_eq!(first.total, second.total);
            prop_assert_eq!(first.fingerprint(), second.fingerprint());
        }
    }
}
