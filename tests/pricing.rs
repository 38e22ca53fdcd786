use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use axum_storefront_api::{
    config::{CheckoutConfig, parse_amount_table},
    models::Product,
    services::pricing::{
        CartLine, FixedDiscounts, FlatRateShipping, PricingError, PricingPolicy, PricingRequest,
        normalize_currency, price_cart, tax_for, to_minor_units,
    },
};

fn product(price: Decimal, currency: &str) -> Product {
    Product {
        id: Uuid::new_v4(),
        title: format!("Product {price}"),
        description: None,
        price,
        currency: currency.to_string(),
        image_url: None,
        stock: 10,
        created_at: Utc::now(),
    }
}

fn request<'a>(lines: &'a [CartLine], currency: &'a str) -> PricingRequest<'a> {
    PricingRequest {
        lines,
        currency,
        shipping_method: None,
        discount_code: None,
    }
}

fn policy(shipping: &[(&str, i64)], discounts: &[(&str, i64)]) -> PricingPolicy {
    let to_map = |entries: &[(&str, i64)]| -> HashMap<String, i64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    };
    PricingPolicy {
        tax_rate_bps: 1000,
        shipping: Arc::new(FlatRateShipping::new(to_map(shipping))),
        discounts: Arc::new(FixedDiscounts::new(to_map(discounts))),
    }
}

#[test]
fn two_units_at_ten_dollars_with_ten_percent_tax() {
    let widget = product(dec!(10.00), "USD");
    let lines = [CartLine {
        product_id: widget.id,
        quantity: 2,
    }];

    let priced = price_cart(
        &request(&lines, "USD"),
        &[widget.clone()],
        &PricingPolicy::from_config(&CheckoutConfig::default()),
    )
    .unwrap();

    assert_eq!(priced.subtotal_minor_units, 2000);
    assert_eq!(priced.shipping_minor_units, 0);
    assert_eq!(priced.tax_minor_units, 200);
    assert_eq!(priced.discount_minor_units, 0);
    assert_eq!(priced.total_minor_units, 2200);
    assert_eq!(priced.items.len(), 1);
    assert_eq!(priced.items[0].title, widget.title);
    assert_eq!(priced.items[0].unit_price_minor_units, 1000);
}

#[test]
fn total_is_the_sum_of_its_parts() {
    let a = product(dec!(19.99), "USD");
    let b = product(dec!(3.35), "USD");
    let lines = [
        CartLine {
            product_id: a.id,
            quantity: 3,
        },
        CartLine {
            product_id: b.id,
            quantity: 1,
        },
    ];
    let policy = policy(&[("standard", 0), ("express", 1500)], &[("SAVE5", 500)]);
    let req = PricingRequest {
        lines: &lines,
        currency: "USD",
        shipping_method: Some("express"),
        discount_code: Some("save5"),
    };

    let priced = price_cart(&req, &[a, b], &policy).unwrap();

    assert_eq!(priced.subtotal_minor_units, 3 * 1999 + 335);
    assert_eq!(priced.shipping_minor_units, 1500);
    assert_eq!(priced.discount_minor_units, 500);
    assert_eq!(
        priced.total_minor_units,
        priced.subtotal_minor_units + priced.shipping_minor_units + priced.tax_minor_units
            - priced.discount_minor_units
    );
    // 6332 * 10% = 633.2
    assert_eq!(priced.tax_minor_units, 633);
}

#[test]
fn lines_keep_cart_order_and_repeat_products() {
    let a = product(dec!(1.00), "USD");
    let b = product(dec!(2.00), "USD");
    let lines = [
        CartLine {
            product_id: b.id,
            quantity: 1,
        },
        CartLine {
            product_id: a.id,
            quantity: 1,
        },
        CartLine {
            product_id: b.id,
            quantity: 2,
        },
    ];

    let priced = price_cart(&request(&lines, "USD"), &[a.clone(), b.clone()], &policy(&[], &[]))
        .unwrap();

    let ids: Vec<Uuid> = priced.items.iter().map(|i| i.product_id).collect();
    assert_eq!(ids, vec![b.id, a.id, b.id]);
    assert_eq!(priced.subtotal_minor_units, 200 + 100 + 400);
}

#[test]
fn minor_unit_conversion_rounds_half_up() {
    assert_eq!(to_minor_units(dec!(10.005), "USD"), Some(1001));
    assert_eq!(to_minor_units(dec!(10.004), "USD"), Some(1000));
    assert_eq!(to_minor_units(dec!(0), "USD"), Some(0));
    assert_eq!(to_minor_units(dec!(-1.00), "USD"), None);
}

#[test]
fn zero_decimal_currencies_have_no_minor_units() {
    assert_eq!(to_minor_units(dec!(500), "JPY"), Some(500));
    assert_eq!(to_minor_units(dec!(499.5), "JPY"), Some(500));

    let item = product(dec!(1200), "JPY");
    let lines = [CartLine {
        product_id: item.id,
        quantity: 2,
    }];
    let priced = price_cart(&request(&lines, "JPY"), &[item], &policy(&[], &[])).unwrap();
    assert_eq!(priced.subtotal_minor_units, 2400);
    assert_eq!(priced.tax_minor_units, 240);
    assert_eq!(priced.total_minor_units, 2640);
}

#[test]
fn tax_rounds_half_up() {
    assert_eq!(tax_for(5, 1000), Some(1));
    assert_eq!(tax_for(4, 1000), Some(0));
    assert_eq!(tax_for(0, 1000), Some(0));
}

#[test]
fn unknown_product_is_reported_by_id() {
    let known = product(dec!(5.00), "USD");
    let missing = Uuid::new_v4();
    let lines = [
        CartLine {
            product_id: known.id,
            quantity: 1,
        },
        CartLine {
            product_id: missing,
            quantity: 1,
        },
    ];

    let err = price_cart(&request(&lines, "USD"), &[known], &policy(&[], &[])).unwrap_err();
    assert_eq!(err, PricingError::UnknownProduct(missing));
}

#[test]
fn rejects_empty_cart_and_bad_quantities() {
    let item = product(dec!(5.00), "USD");
    assert_eq!(
        price_cart(&request(&[], "USD"), &[item.clone()], &policy(&[], &[])).unwrap_err(),
        PricingError::EmptyCart
    );

    let lines = [CartLine {
        product_id: item.id,
        quantity: 0,
    }];
    assert_eq!(
        price_cart(&request(&lines, "USD"), &[item.clone()], &policy(&[], &[])).unwrap_err(),
        PricingError::InvalidQuantity(item.id)
    );
}

#[test]
fn discount_larger_than_order_is_rejected() {
    let item = product(dec!(1.00), "USD");
    let lines = [CartLine {
        product_id: item.id,
        quantity: 1,
    }];
    let req = PricingRequest {
        lines: &lines,
        currency: "USD",
        shipping_method: None,
        discount_code: Some("BIG"),
    };

    let err = price_cart(&req, &[item], &policy(&[], &[("BIG", 10_000)])).unwrap_err();
    assert_eq!(err, PricingError::NegativeTotal);
}

#[test]
fn unknown_shipping_method_and_discount_code_are_rejected() {
    let item = product(dec!(1.00), "USD");
    let lines = [CartLine {
        product_id: item.id,
        quantity: 1,
    }];
    let policy = policy(&[("standard", 0)], &[]);

    let req = PricingRequest {
        shipping_method: Some("overnight"),
        ..request(&lines, "USD")
    };
    assert!(matches!(
        price_cart(&req, &[item.clone()], &policy),
        Err(PricingError::UnknownShippingMethod(_))
    ));

    let req = PricingRequest {
        discount_code: Some("NOPE"),
        ..request(&lines, "USD")
    };
    assert!(matches!(
        price_cart(&req, &[item], &policy),
        Err(PricingError::UnknownDiscountCode(_))
    ));
}

#[test]
fn product_in_another_currency_is_rejected() {
    let item = product(dec!(1.00), "EUR");
    let lines = [CartLine {
        product_id: item.id,
        quantity: 1,
    }];
    assert!(matches!(
        price_cart(&request(&lines, "USD"), &[item], &policy(&[], &[])),
        Err(PricingError::CurrencyMismatch { .. })
    ));
}

#[test]
fn currency_codes_are_normalized() {
    assert_eq!(normalize_currency(" usd ").unwrap(), "USD");
    assert!(normalize_currency("US").is_err());
    assert!(normalize_currency("12$").is_err());
}

#[test]
fn amount_tables_parse_from_env_format() {
    let table = parse_amount_table("standard=0, express=1500").unwrap();
    assert_eq!(table.get("standard"), Some(&0));
    assert_eq!(table.get("express"), Some(&1500));

    assert!(parse_amount_table("express").is_err());
    assert!(parse_amount_table("express=-1").is_err());
}
