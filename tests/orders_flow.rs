mod common;

use std::sync::Arc;

use rust_decimal_macros::dec;
use uuid::Uuid;

use axum_storefront_api::{
    audit::PgAuditLog,
    config::CheckoutConfig,
    db::{create_pool, orm_from_pool, run_migrations},
    middleware::auth::JwtAuth,
    models::{NewProduct, OrderStatus},
    payments::EVENT_PAYMENT_SUCCEEDED,
    services::{
        checkout_service,
        webhook_service::{WebhookOutcome, handle_payment_event},
    },
    state::AppState,
    store::{CatalogStore, OrderStore, OrmStore},
};

use common::{FakeGateway, JWT_SECRET, build_state, cart, payment_event, sign_now};

async fn setup_state(database_url: &str) -> anyhow::Result<(AppState, Arc<OrmStore>)> {
    let pool = create_pool(database_url).await?;
    run_migrations(&pool).await?;

    let store = Arc::new(OrmStore::new(orm_from_pool(&pool)));
    let state = build_state(
        store.clone(),
        Arc::new(PgAuditLog::new(pool)),
        Arc::new(FakeGateway::default()),
        Arc::new(JwtAuth::new(JWT_SECRET, 1)),
        CheckoutConfig::default(),
    );
    Ok((state, store))
}

// Checkout against Postgres, then reconcile the same success event twice.
#[tokio::test]
async fn checkout_and_webhook_reconcile_against_postgres() -> anyhow::Result<()> {
    // Allow skipping when no DB is configured in the environment.
    let database_url = match std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
    {
        Ok(url) => url,
        Err(_) => {
            eprintln!(
                "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration flow tests."
            );
            return Ok(());
        }
    };

    let (state, store) = setup_state(&database_url).await?;

    let product = CatalogStore::create(
        store.as_ref(),
        NewProduct {
            title: format!("Test Widget {}", Uuid::new_v4()),
            description: Some("A product for testing".into()),
            price: dec!(10.00),
            currency: "USD".into(),
            image_url: None,
            stock: 10,
        },
    )
    .await?;

    let key = format!("flow-{}", Uuid::new_v4());
    let first = checkout_service::checkout(&state, None, &key, cart(&[(product.id, 2)]))
        .await?
        .data
        .expect("checkout data");
    let again = checkout_service::checkout(&state, None, &key, cart(&[(product.id, 2)]))
        .await?
        .data
        .expect("checkout data");
    assert_eq!(first.order_id, again.order_id);

    let order = OrderStore::find_by_id(store.as_ref(), first.order_id)
        .await?
        .expect("order stored");
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.total_minor_units, 2200);
    assert_eq!(order.items.len(), 1);
    let intent_id = order.payment.expect("payment attached").provider_payment_id;

    let payload = payment_event(EVENT_PAYMENT_SUCCEEDED, Some(order.id), &intent_id);
    let header = sign_now(&payload);
    let outcome = handle_payment_event(&state, &payload, Some(&header)).await?;
    assert_eq!(outcome, WebhookOutcome::Applied(OrderStatus::Paid));
    let outcome = handle_payment_event(&state, &payload, Some(&header)).await?;
    assert_eq!(outcome, WebhookOutcome::Duplicate);

    let paid = OrderStore::find_by_id(store.as_ref(), order.id)
        .await?
        .expect("order stored");
    assert_eq!(paid.status, OrderStatus::Paid);
    assert!(paid.payment.expect("payment").success);

    let product = CatalogStore::find_by_id(store.as_ref(), product.id)
        .await?
        .expect("product");
    assert_eq!(product.stock, 8);

    Ok(())
}
