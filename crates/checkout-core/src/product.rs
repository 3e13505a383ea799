//! # Product Types
//!
//! Product and money types for the storefront.
//! Prices are fixed-point decimals; nothing in checkout touches `f64`.

use crate::error::{ShopError, ShopResult};
use crate::ids::ProductId;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported currencies (ISO 4217). The store runs in exactly one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    #[default]
    USD,
    EUR,
    GBP,
    JPY,
    CAD,
    AUD,
}

impl Currency {
    /// Returns the lowercase ISO 4217 code used by payment providers
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::USD => "usd",
            Currency::EUR => "eur",
            Currency::GBP => "gbp",
            Currency::JPY => "jpy",
            Currency::CAD => "cad",
            Currency::AUD => "aud",
        }
    }

    /// Parse a currency code, case-insensitively
    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_ascii_lowercase().as_str() {
            "usd" => Some(Currency::USD),
            "eur" => Some(Currency::EUR),
            "gbp" => Some(Currency::GBP),
            "jpy" => Some(Currency::JPY),
            "cad" => Some(Currency::CAD),
            "aud" => Some(Currency::AUD),
            _ => None,
        }
    }

    /// Returns the number of decimal places for this currency
    /// (JPY has 0 decimals, the others have 2)
    pub fn decimal_places(&self) -> u32 {
        match self {
            Currency::JPY => 0,
            _ => 2,
        }
    }

    /// Display symbol
    pub fn symbol(&self) -> &'static str {
        match self {
            Currency::USD => "$",
            Currency::EUR => "€",
            Currency::GBP => "£",
            Currency::JPY => "¥",
            Currency::CAD => "C$",
            Currency::AUD => "A$",
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

impl FromStr for Currency {
    type Err = ShopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::from_code(s)
            .ok_or_else(|| ShopError::Configuration(format!("Unsupported currency: {}", s)))
    }
}

/// A decimal amount in a currency's standard unit (dollars, not cents)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Currency,
}

impl Price {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    /// Zero in the given currency
    pub fn zero(currency: Currency) -> Self {
        Self::new(Decimal::ZERO, currency)
    }

    /// Parse a decimal string such as `"9.99"`
    pub fn parse(amount: &str, currency: Currency) -> ShopResult<Self> {
        let amount = Decimal::from_str(amount)
            .map_err(|e| ShopError::InvalidRequest(format!("Invalid price '{}': {}", amount, e)))?;
        Ok(Self::new(amount, currency))
    }

    /// Build a price from the smallest currency unit (cents for USD)
    pub fn from_smallest_unit(amount: i64, currency: Currency) -> Self {
        Self::new(Decimal::new(amount, currency.decimal_places()), currency)
    }

    /// Amount in the smallest currency unit, rounded up.
    ///
    /// Fractional prices (e.g. `0.333`) round toward the next cent so the
    /// store is never under-charged.
    pub fn to_smallest_unit_ceil(&self) -> ShopResult<i64> {
        let scale = Decimal::from(10_i64.pow(self.currency.decimal_places()));
        self.amount
            .checked_mul(scale)
            .map(|scaled| scaled.ceil())
            .and_then(|scaled| scaled.to_i64())
            .ok_or_else(|| {
                ShopError::InvalidChargeRequest(format!("Amount out of range: {}", self.amount))
            })
    }

    /// Unit price multiplied by a quantity
    pub fn checked_times(&self, quantity: u32) -> ShopResult<Self> {
        self.amount
            .checked_mul(Decimal::from(quantity))
            .map(|amount| Self::new(amount, self.currency))
            .ok_or_else(|| ShopError::InvalidRequest("Price overflow".to_string()))
    }

    /// Sum of two prices in the same currency
    pub fn checked_add(&self, other: &Price) -> ShopResult<Self> {
        if self.currency != other.currency {
            return Err(ShopError::InvalidRequest(format!(
                "Currency mismatch: {} vs {}",
                self.currency, other.currency
            )));
        }
        self.amount
            .checked_add(other.amount)
            .map(|amount| Self::new(amount, self.currency))
            .ok_or_else(|| ShopError::InvalidRequest("Price overflow".to_string()))
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    /// Format for display (e.g., "$9.99", "$10.00", "¥1200")
    pub fn display(&self) -> String {
        let places = self.currency.decimal_places();
        let rounded = self
            .amount
            .round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero);
        format!("{}{:.*}", self.currency.symbol(), places as usize, rounded)
    }
}

/// A product in the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    /// Unique product identifier
    pub id: ProductId,

    /// Display title
    pub title: String,

    /// Short description
    #[serde(default)]
    pub description: String,

    /// Optional category used for catalog filtering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Unit price
    pub price: Price,

    /// Whether this product is available for purchase
    #[serde(default = "default_true")]
    pub active: bool,

    /// Optional image URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Product {
    pub fn new(id: impl Into<ProductId>, title: impl Into<String>, price: Price) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            category: None,
            price,
            active: true,
            image_url: None,
        }
    }

    /// Builder: set description
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Builder: set category
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Builder: set image URL
    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    /// Builder: mark as withdrawn from sale
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd(amount: &str) -> Price {
        Price::parse(amount, Currency::USD).unwrap()
    }

    #[test]
    fn test_smallest_unit_rounds_up() {
        assert_eq!(usd("9.99").to_smallest_unit_ceil().unwrap(), 999);
        assert_eq!(usd("0.333").to_smallest_unit_ceil().unwrap(), 34);
        assert_eq!(usd("10").to_smallest_unit_ceil().unwrap(), 1000);

        let yen = Price::parse("1200.4", Currency::JPY).unwrap();
        assert_eq!(yen.to_smallest_unit_ceil().unwrap(), 1201);
    }

    #[test]
    fn test_price_arithmetic_is_exact() {
        let total = usd("9.99").checked_times(3).unwrap();
        assert_eq!(total, usd("29.97"));

        let sum = usd("0.1").checked_add(&usd("0.2")).unwrap();
        assert_eq!(sum, usd("0.3"));
    }

    #[test]
    fn test_currency_mismatch_rejected() {
        let eur = Price::parse("1", Currency::EUR).unwrap();
        assert!(usd("1").checked_add(&eur).is_err());
    }

    #[test]
    fn test_price_display() {
        assert_eq!(usd("9.99").display(), "$9.99");
        assert_eq!(usd("10").display(), "$10.00");
        assert_eq!(usd("29.970").display(), "$29.97");
        assert_eq!(Price::parse("19.5", Currency::EUR).unwrap().display(), "€19.50");
        assert_eq!(Price::parse("1200", Currency::JPY).unwrap().display(), "¥1200");
    }

    #[test]
    fn test_from_smallest_unit() {
        assert_eq!(Price::from_smallest_unit(2997, Currency::USD), usd("29.97"));
    }

    #[test]
    fn test_currency_parse() {
        assert_eq!("USD".parse::<Currency>().unwrap(), Currency::USD);
        assert!("xyz".parse::<Currency>().is_err());
    }

    #[test]
    fn test_product_from_toml() {
        let product: Product = toml::from_str(
            r#"
            id = "widget"
            title = "Widget"
            description = "A widget"
            price = { amount = "9.99", currency = "usd" }
            "#,
        )
        .unwrap();

        assert_eq!(product.id, ProductId::new("widget"));
        assert_eq!(product.price, usd("9.99"));
        assert!(product.active);
    }
}
