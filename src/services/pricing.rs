//! Cart pricing: line-item snapshots and order totals in minor units.
//!
//! Everything here is a pure function of the cart, a catalog snapshot and
//! the configured policies.

use std::{collections::HashMap, sync::Arc};

use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    config::CheckoutConfig,
    models::{OrderItem, Product},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("Cart is empty")]
    EmptyCart,

    #[error("Unknown product {0}")]
    UnknownProduct(Uuid),

    #[error("Quantity for product {0} must be a positive integer")]
    InvalidQuantity(Uuid),

    #[error("Product {product} is priced in {found}, not {expected}")]
    CurrencyMismatch {
        product: Uuid,
        expected: String,
        found: String,
    },

    #[error("Product {0} has an invalid price")]
    InvalidPrice(Uuid),

    #[error("Invalid currency {0}")]
    InvalidCurrency(String),

    #[error("Unknown shipping method {0}")]
    UnknownShippingMethod(String),

    #[error("Unknown discount code {0}")]
    UnknownDiscountCode(String),

    #[error("Discount exceeds the order amount")]
    NegativeTotal,

    #[error("Order amount is too large")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CartLine {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct PricingRequest<'a> {
    pub lines: &'a [CartLine],
    /// Normalized upper-case currency code.
    pub currency: &'a str,
    pub shipping_method: Option<&'a str>,
    pub discount_code: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedCart {
    pub items: Vec<OrderItem>,
    pub subtotal_minor_units: i64,
    pub shipping_minor_units: i64,
    pub tax_minor_units: i64,
    pub discount_minor_units: i64,
    pub total_minor_units: i64,
}

pub trait ShippingPolicy: Send + Sync {
    fn quote(&self, method: Option<&str>, subtotal_minor_units: i64) -> Result<i64, PricingError>;
}

pub trait DiscountPolicy: Send + Sync {
    fn resolve(&self, code: Option<&str>, subtotal_minor_units: i64) -> Result<i64, PricingError>;
}

/// Flat shipping rates keyed by method name.
pub struct FlatRateShipping {
    rates: HashMap<String, i64>,
}

impl FlatRateShipping {
    pub const DEFAULT_METHOD: &'static str = "standard";

    pub fn new(rates: HashMap<String, i64>) -> Self {
        Self { rates }
    }
}

impl ShippingPolicy for FlatRateShipping {
    fn quote(&self, method: Option<&str>, _subtotal_minor_units: i64) -> Result<i64, PricingError> {
        match method.map(str::trim).filter(|m| !m.is_empty()) {
            Some(method) => self
                .rates
                .get(method)
                .copied()
                .ok_or_else(|| PricingError::UnknownShippingMethod(method.to_string())),
            None => Ok(self.rates.get(Self::DEFAULT_METHOD).copied().unwrap_or(0)),
        }
    }
}

/// Fixed-amount discount codes, matched case-insensitively.
pub struct FixedDiscounts {
    codes: HashMap<String, i64>,
}

impl FixedDiscounts {
    pub fn new(codes: HashMap<String, i64>) -> Self {
        let codes = codes
            .into_iter()
            .map(|(code, amount)| (code.to_uppercase(), amount))
            .collect();
        Self { codes }
    }
}

impl DiscountPolicy for FixedDiscounts {
    fn resolve(&self, code: Option<&str>, _subtotal_minor_units: i64) -> Result<i64, PricingError> {
        match code.map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => self
                .codes
                .get(&code.to_uppercase())
                .copied()
                .ok_or_else(|| PricingError::UnknownDiscountCode(code.to_string())),
            None => Ok(0),
        }
    }
}

#[derive(Clone)]
pub struct PricingPolicy {
    /// Basis points of the subtotal charged as tax.
    pub tax_rate_bps: i64,
    pub shipping: Arc<dyn ShippingPolicy>,
    pub discounts: Arc<dyn DiscountPolicy>,
}

impl PricingPolicy {
    pub fn from_config(config: &CheckoutConfig) -> Self {
        Self {
            tax_rate_bps: config.tax_rate_bps,
            shipping: Arc::new(FlatRateShipping::new(config.shipping_rates.clone())),
            discounts: Arc::new(FixedDiscounts::new(config.discount_codes.clone())),
        }
    }
}

const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

pub fn minor_unit_exponent(currency: &str) -> u32 {
    if ZERO_DECIMAL_CURRENCIES.contains(&currency) {
        0
    } else {
        2
    }
}

pub fn normalize_currency(raw: &str) -> Result<String, PricingError> {
    let code = raw.trim();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code.to_ascii_uppercase())
    } else {
        Err(PricingError::InvalidCurrency(raw.to_string()))
    }
}

/// Converts a major-unit price to minor units, rounding half up.
pub fn to_minor_units(price: Decimal, currency: &str) -> Option<i64> {
    if price.is_sign_negative() {
        return None;
    }
    let scale = Decimal::from(10_i64.pow(minor_unit_exponent(currency)));
    price
        .checked_mul(scale)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Tax on a non-negative subtotal, rounded half up to a whole minor unit.
pub fn tax_for(subtotal_minor_units: i64, tax_rate_bps: i64) -> Option<i64> {
    subtotal_minor_units
        .checked_mul(tax_rate_bps)?
        .checked_add(5_000)
        .map(|scaled| scaled / 10_000)
}

pub fn price_cart(
    request: &PricingRequest<'_>,
    catalog: &[Product],
    policy: &PricingPolicy,
) -> Result<PricedCart, PricingError> {
    if request.lines.is_empty() {
        return Err(PricingError::EmptyCart);
    }

    let mut items = Vec::with_capacity(request.lines.len());
    let mut subtotal: i64 = 0;
    for line in request.lines {
        let product = catalog
            .iter()
            .find(|p| p.id == line.product_id)
            .ok_or(PricingError::UnknownProduct(line.product_id))?;
        if line.quantity <= 0 {
            return Err(PricingError::InvalidQuantity(line.product_id));
        }
        if !product.currency.eq_ignore_ascii_case(request.currency) {
            return Err(PricingError::CurrencyMismatch {
                product: product.id,
                expected: request.currency.to_string(),
                found: product.currency.clone(),
            });
        }

        let unit_price = to_minor_units(product.price, request.currency)
            .ok_or(PricingError::InvalidPrice(product.id))?;
        let line_total = unit_price
            .checked_mul(i64::from(line.quantity))
            .ok_or(PricingError::Overflow)?;
        subtotal = subtotal.checked_add(line_total).ok_or(PricingError::Overflow)?;

        items.push(OrderItem {
            product_id: product.id,
            title: product.title.clone(),
            unit_price_minor_units: unit_price,
            quantity: line.quantity,
        });
    }

    let shipping = policy.shipping.quote(request.shipping_method, subtotal)?;
    let tax = tax_for(subtotal, policy.tax_rate_bps).ok_or(PricingError::Overflow)?;
    let discount = policy.discounts.resolve(request.discount_code, subtotal)?;

    let total = subtotal
        .checked_add(shipping)
        .and_then(|t| t.checked_add(tax))
        .and_then(|t| t.checked_sub(discount))
        .ok_or(PricingError::Overflow)?;
    if total < 0 {
        return Err(PricingError::NegativeTotal);
    }

    Ok(PricedCart {
        items,
        subtotal_minor_units: subtotal,
        shipping_minor_units: shipping,
        tax_minor_units: tax,
        discount_minor_units: discount,
        total_minor_units: total,
    })
}
