mod common;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use rust_decimal_macros::dec;
use tokio::task::JoinSet;
use uuid::Uuid;

use axum_storefront_api::{
    config::CheckoutConfig,
    error::AppError,
    models::{Order, OrderStatus},
    payments::{EVENT_PAYMENT_FAILED, EVENT_PAYMENT_SUCCEEDED, SignatureError, signature},
    services::webhook_service::{WebhookOutcome, handle_payment_event},
    store::{
        CatalogStore, MemoryStore, OrderStore, ReservationStore, Settlement, StoreError,
        StoreResult,
    },
};

use common::{TestApp, body_json, cart, payment_event, payment_event_with_amount, sign_now};

/// Checks out `quantity` units of a fresh product with 10 in stock.
async fn pending_order(app: &TestApp, quantity: i32) -> (Order, Uuid) {
    let product = app.add_product("Widget", dec!(10.00), 10).await;
    let resp = app
        .checkout(None, &format!("key-{}", Uuid::new_v4()), cart(&[(product.id, quantity)]))
        .await
        .expect("checkout");
    let order = OrderStore::find_by_id(app.store.as_ref(), resp.order_id)
        .await
        .unwrap()
        .unwrap();
    (order, product.id)
}

fn intent_id(order: &Order) -> String {
    order
        .payment
        .as_ref()
        .expect("payment attached")
        .provider_payment_id
        .clone()
}

async fn stock_of(app: &TestApp, product_id: Uuid) -> i32 {
    CatalogStore::find_by_id(app.store.as_ref(), product_id)
        .await
        .unwrap()
        .unwrap()
        .stock
}

async fn deliver(app: &TestApp, payload: &[u8]) -> Result<WebhookOutcome, AppError> {
    let header = sign_now(payload);
    handle_payment_event(&app.state, payload, Some(&header)).await
}

#[tokio::test]
async fn succeeded_event_marks_order_paid_and_consumes_stock() {
    let app = TestApp::new();
    let (order, product_id) = pending_order(&app, 2).await;
    let payload = payment_event(EVENT_PAYMENT_SUCCEEDED, Some(order.id), &intent_id(&order));

    let outcome = deliver(&app, &payload).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Applied(OrderStatus::Paid));

    let paid = OrderStore::find_by_id(app.store.as_ref(), order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paid.status, OrderStatus::Paid);
    let payment = paid.payment.expect("payment");
    assert!(payment.success);
    assert_eq!(payment.provider_payment_id, intent_id(&order));
    assert_eq!(payment.raw["object"], "payment_intent");

    assert_eq!(stock_of(&app, product_id).await, 8);
    assert!(app.store.reservations_for(order.id).await.is_empty());
    assert!(
        app.store
            .audit_entries()
            .await
            .iter()
            .any(|e| e.action == "order_paid")
    );
}

#[tokio::test]
async fn duplicate_delivery_has_no_further_effect() {
    let app = TestApp::new();
    let (order, product_id) = pending_order(&app, 3).await;
    let payload = payment_event(EVENT_PAYMENT_SUCCEEDED, Some(order.id), &intent_id(&order));

    deliver(&app, &payload).await.unwrap();
    let writes = app.store.order_writes().await;

    let outcome = deliver(&app, &payload).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Duplicate);
    assert_eq!(app.store.order_writes().await, writes);
    assert_eq!(stock_of(&app, product_id).await, 7);

    let paid_audits = app
        .store
        .audit_entries()
        .await
        .into_iter()
        .filter(|e| e.action == "order_paid")
        .count();
    assert_eq!(paid_audits, 1);
}

#[tokio::test]
async fn failed_event_cancels_and_a_late_success_is_ignored() {
    let app = TestApp::new();
    let (order, product_id) = pending_order(&app, 2).await;
    let intent = intent_id(&order);

    let failed = payment_event(EVENT_PAYMENT_FAILED, Some(order.id), &intent);
    assert_eq!(
        deliver(&app, &failed).await.unwrap(),
        WebhookOutcome::Applied(OrderStatus::Cancelled)
    );

    let cancelled = OrderStore::find_by_id(app.store.as_ref(), order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(!cancelled.payment.unwrap().success);
    assert!(app.store.reservations_for(order.id).await.is_empty());
    assert_eq!(stock_of(&app, product_id).await, 10);

    let succeeded = payment_event(EVENT_PAYMENT_SUCCEEDED, Some(order.id), &intent);
    assert_eq!(
        deliver(&app, &succeeded).await.unwrap(),
        WebhookOutcome::Superseded
    );
    let still = OrderStore::find_by_id(app.store.as_ref(), order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still.status, OrderStatus::Cancelled);
    assert_eq!(stock_of(&app, product_id).await, 10);
}

#[tokio::test]
async fn concurrent_deliveries_apply_exactly_once() {
    let app = TestApp::new();
    let (order, product_id) = pending_order(&app, 1).await;
    let payload = payment_event(EVENT_PAYMENT_SUCCEEDED, Some(order.id), &intent_id(&order));
    let header = sign_now(&payload);

    let mut deliveries = JoinSet::new();
    for _ in 0..8 {
        let state = app.state.clone();
        let payload = payload.clone();
        let header = header.clone();
        deliveries.spawn(async move { handle_payment_event(&state, &payload, Some(&header)).await });
    }

    let mut applied = 0;
    while let Some(result) = deliveries.join_next().await {
        match result.unwrap().unwrap() {
            WebhookOutcome::Applied(_) => applied += 1,
            WebhookOutcome::Duplicate => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(stock_of(&app, product_id).await, 9);
}

#[tokio::test]
async fn invalid_signature_is_rejected_without_writes() {
    let app = TestApp::new();
    let (order, _) = pending_order(&app, 1).await;
    let payload = payment_event(EVENT_PAYMENT_SUCCEEDED, Some(order.id), &intent_id(&order));
    let writes = app.store.order_writes().await;

    let timestamp = Utc::now().timestamp();
    let forged = format!(
        "t={timestamp},v1={}",
        signature::sign(&payload, "whsec_wrong", timestamp)
    );
    let err = handle_payment_event(&app.state, &payload, Some(&forged))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AppError::WebhookAuthenticity(SignatureError::Mismatch)
    ));
    assert_eq!(app.store.order_writes().await, writes);
}

#[tokio::test]
async fn tampered_body_is_rejected() {
    let app = TestApp::new();
    let (order, _) = pending_order(&app, 1).await;
    let payload = payment_event(EVENT_PAYMENT_SUCCEEDED, Some(order.id), &intent_id(&order));
    let header = sign_now(&payload);

    let mut tampered = payload.clone();
    tampered.push(b' ');
    let err = handle_payment_event(&app.state, &tampered, Some(&header))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::WebhookAuthenticity(SignatureError::Mismatch)
    ));
}

#[tokio::test]
async fn stale_signature_is_rejected() {
    let app = TestApp::new();
    let payload = payment_event(EVENT_PAYMENT_SUCCEEDED, Some(Uuid::new_v4()), "pi_old");
    let signed_at = Utc::now().timestamp() - 3_600;
    let header = format!(
        "t={signed_at},v1={}",
        signature::sign(&payload, common::WEBHOOK_SECRET, signed_at)
    );

    let err = handle_payment_event(&app.state, &payload, Some(&header))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::WebhookAuthenticity(SignatureError::Expired)
    ));
}

#[tokio::test]
async fn unknown_order_is_acknowledged_without_writes() {
    let app = TestApp::new();
    let writes = app.store.order_writes().await;
    let payload = payment_event(EVENT_PAYMENT_SUCCEEDED, Some(Uuid::new_v4()), "pi_ghost");

    assert_eq!(
        deliver(&app, &payload).await.unwrap(),
        WebhookOutcome::Unmatched
    );
    assert_eq!(app.store.order_writes().await, writes);
}

#[tokio::test]
async fn event_without_order_reference_is_acknowledged() {
    let app = TestApp::new();
    let payload = payment_event(EVENT_PAYMENT_SUCCEEDED, None, "pi_orphan");
    assert_eq!(
        deliver(&app, &payload).await.unwrap(),
        WebhookOutcome::Unmatched
    );
}

#[tokio::test]
async fn other_event_types_are_ignored() {
    let app = TestApp::new();
    let (order, _) = pending_order(&app, 1).await;
    let payload = payment_event("charge.refunded", Some(order.id), &intent_id(&order));

    assert_eq!(
        deliver(&app, &payload).await.unwrap(),
        WebhookOutcome::Ignored
    );
    let unchanged = OrderStore::find_by_id(app.store.as_ref(), order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged.status, OrderStatus::Pending);
}

#[tokio::test]
async fn late_payment_on_oversold_stock_never_goes_negative() {
    let app = TestApp::with_config(CheckoutConfig {
        reservation_ttl: chrono::Duration::milliseconds(10),
        ..CheckoutConfig::default()
    });
    let product = app.add_product("Last Widget", dec!(10.00), 1).await;

    let first = app
        .checkout(None, "key-late-a", cart(&[(product.id, 1)]))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let second = app
        .checkout(None, "key-late-b", cart(&[(product.id, 1)]))
        .await
        .unwrap();

    for order_id in [first.order_id, second.order_id] {
        let order = OrderStore::find_by_id(app.store.as_ref(), order_id)
            .await
            .unwrap()
            .unwrap();
        let payload = payment_event(EVENT_PAYMENT_SUCCEEDED, Some(order.id), &intent_id(&order));
        let outcome = deliver(&app, &payload).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied(OrderStatus::Paid));
    }

    assert_eq!(stock_of(&app, product.id).await, 0);
    let short = app
        .store
        .audit_entries()
        .await
        .into_iter()
        .find(|e| e.action == "order_stock_short")
        .expect("shortfall recorded");
    let metadata = short.metadata.expect("metadata");
    assert_eq!(metadata["orderId"], second.order_id.to_string());
    assert_eq!(metadata["productIds"][0], product.id.to_string());
}

/// Delegates to the memory store; the first `finalize` fails.
struct FinalizeFailsOnce {
    inner: Arc<MemoryStore>,
    failed: AtomicBool,
}

#[async_trait]
impl ReservationStore for FinalizeFailsOnce {
    async fn renew(&self, order_id: Uuid, until: DateTime<Utc>) -> StoreResult<()> {
        self.inner.renew(order_id, until).await
    }

    async fn finalize(&self, order_id: Uuid) -> StoreResult<Settlement> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Db(sqlx::Error::PoolTimedOut));
        }
        self.inner.finalize(order_id).await
    }

    async fn release(&self, order_id: Uuid) -> StoreResult<u64> {
        self.inner.release(order_id).await
    }
}

#[tokio::test]
async fn redelivery_finishes_settlement_interrupted_after_the_transition() {
    let mut app = TestApp::new();
    let (order, product_id) = pending_order(&app, 2).await;
    app.state.reservations = Arc::new(FinalizeFailsOnce {
        inner: app.store.clone(),
        failed: AtomicBool::new(false),
    });
    let payload = payment_event(EVENT_PAYMENT_SUCCEEDED, Some(order.id), &intent_id(&order));

    let err = deliver(&app, &payload).await.unwrap_err();
    assert!(matches!(err, AppError::Store(_)), "got {err:?}");
    assert_eq!(
        err.into_response().status(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
    let paid = OrderStore::find_by_id(app.store.as_ref(), order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paid.status, OrderStatus::Paid);
    assert_eq!(stock_of(&app, product_id).await, 10);
    assert_eq!(app.store.reservations_for(order.id).await.len(), 1);

    let outcome = deliver(&app, &payload).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Duplicate);
    assert_eq!(stock_of(&app, product_id).await, 8);
    assert!(app.store.reservations_for(order.id).await.is_empty());

    let outcome = deliver(&app, &payload).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Duplicate);
    assert_eq!(stock_of(&app, product_id).await, 8);

    let paid_audits = app
        .store
        .audit_entries()
        .await
        .into_iter()
        .filter(|e| e.action == "order_paid")
        .count();
    assert_eq!(paid_audits, 1);
}

#[tokio::test]
async fn http_webhook_reports_persistence_failure_for_retry() {
    let mut app = TestApp::new();
    let (order, _) = pending_order(&app, 1).await;
    app.state.reservations = Arc::new(FinalizeFailsOnce {
        inner: app.store.clone(),
        failed: AtomicBool::new(false),
    });
    let payload = payment_event(EVENT_PAYMENT_SUCCEEDED, Some(order.id), &intent_id(&order));

    let header = sign_now(&payload);
    let response = app.send(webhook_request(payload.clone(), Some(header))).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let header = sign_now(&payload);
    let response = app.send(webhook_request(payload, Some(header))).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn amount_mismatch_is_still_applied() {
    let app = TestApp::new();
    let (order, product_id) = pending_order(&app, 1).await;
    let payload = payment_event_with_amount(
        EVENT_PAYMENT_SUCCEEDED,
        order.id,
        &intent_id(&order),
        order.total_minor_units + 100,
    );

    let outcome = deliver(&app, &payload).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Applied(OrderStatus::Paid));
    assert_eq!(stock_of(&app, product_id).await, 9);
}

fn webhook_request(payload: Vec<u8>, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/webhooks/stripe")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("Stripe-Signature", signature);
    }
    builder.body(Body::from(payload)).unwrap()
}

#[tokio::test]
async fn http_webhook_acknowledges_valid_delivery() {
    let app = TestApp::new();
    let (order, _) = pending_order(&app, 1).await;
    let payload = payment_event(EVENT_PAYMENT_SUCCEEDED, Some(order.id), &intent_id(&order));
    let header = sign_now(&payload);

    let response = app.send(webhook_request(payload, Some(header))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, serde_json::json!({ "received": true }));

    let paid = OrderStore::find_by_id(app.store.as_ref(), order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paid.status, OrderStatus::Paid);
}

#[tokio::test]
async fn http_webhook_without_signature_is_bad_request() {
    let app = TestApp::new();
    let payload = payment_event(EVENT_PAYMENT_SUCCEEDED, Some(Uuid::new_v4()), "pi_x");

    let response = app.send(webhook_request(payload, None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn http_webhook_acknowledges_unknown_order() {
    let app = TestApp::new();
    let payload = payment_event(EVENT_PAYMENT_SUCCEEDED, Some(Uuid::new_v4()), "pi_ghost");
    let header = sign_now(&payload);

    let response = app.send(webhook_request(payload, Some(header))).await;
    assert_eq!(response.status(), StatusCode::OK);
}
