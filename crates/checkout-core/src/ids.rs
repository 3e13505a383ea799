//! # Identifiers
//!
//! Newtype ids so product, user and order references cannot be mixed up,
//! plus the request-scoped `Identity` handed to every core operation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Define a string-backed id newtype.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing id value
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the underlying string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

define_id!(
    /// Catalog product identifier
    ProductId
);
define_id!(
    /// Storefront user identifier
    UserId
);
define_id!(
    /// Persisted order identifier
    OrderId
);

impl OrderId {
    /// Generate a fresh order id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// The authenticated user a request acts on behalf of.
///
/// Produced by the (external) session layer and passed explicitly into
/// checkout, cart and invoice operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub email: String,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_order_ids_are_unique() {
        assert_ne!(OrderId::generate(), OrderId::generate());
    }

    #[test]
    fn test_id_serializes_transparently() {
        let id = ProductId::new("widget");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"widget\"");
        assert_eq!(id.to_string(), "widget");
    }
}
