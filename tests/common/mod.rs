#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response},
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tower::ServiceExt;
use uuid::Uuid;

use axum_storefront_api::{
    config::CheckoutConfig,
    dto::checkout::{CheckoutItem, CheckoutRequest, CheckoutResponse},
    error::AppResult,
    middleware::auth::{AuthUser, JwtAuth},
    models::{NewProduct, NewUser, Product, User},
    payments::{
        GatewayError, PaymentGateway, PaymentIntent, PaymentIntentRequest, SignatureError,
        WebhookEvent, signature,
    },
    routes::app_router,
    services::{checkout_service, pricing::PricingPolicy},
    state::AppState,
    store::{AuditLog, CatalogStore, MemoryStore, OrderStore, ReservationStore, UserStore},
};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const JWT_SECRET: &str = "test-jwt-secret";

/// In-process payment provider. Creating an intent twice for one order
/// returns the same intent, like the real provider's idempotency keys.
#[derive(Default)]
pub struct FakeGateway {
    intents: Mutex<HashMap<Uuid, PaymentIntent>>,
    pub requests: Mutex<Vec<PaymentIntentRequest>>,
    create_calls: AtomicUsize,
    retrieve_calls: AtomicUsize,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl FakeGateway {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.lock().await = Some(delay);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn retrieve_calls(&self) -> usize {
        self.retrieve_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn provider(&self) -> &'static str {
        "stripe"
    }

    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, GatewayError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                status: 503,
                message: "provider unavailable".into(),
            });
        }

        self.requests.lock().await.push(request.clone());
        let mut intents = self.intents.lock().await;
        let intent = intents.entry(request.order_id).or_insert_with(|| {
            let id = format!("pi_{}", request.order_id.simple());
            PaymentIntent {
                client_secret: format!("{id}_secret"),
                id,
            }
        });
        Ok(intent.clone())
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, GatewayError> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                status: 503,
                message: "provider unavailable".into(),
            });
        }

        self.intents
            .lock()
            .await
            .values()
            .find(|intent| intent.id == id)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected {
                status: 404,
                message: format!("No such payment_intent: {id}"),
            })
    }

    fn construct_event(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookEvent, SignatureError> {
        signature::construct_event(
            payload,
            signature_header,
            WEBHOOK_SECRET,
            Duration::from_secs(300),
            Utc::now().timestamp(),
        )
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
    pub tokens: Arc<JwtAuth>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(CheckoutConfig::default())
    }

    pub fn with_config(checkout: CheckoutConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway::default());
        let tokens = Arc::new(JwtAuth::new(JWT_SECRET, 1));
        let state = build_state(store.clone(), store.clone(), gateway.clone(), tokens.clone(), checkout);
        Self {
            state,
            store,
            gateway,
            tokens,
        }
    }

    pub fn router(&self) -> Router {
        app_router(self.state.clone())
    }

    pub async fn add_product(&self, title: &str, price: Decimal, stock: i32) -> Product {
        CatalogStore::create(
            self.store.as_ref(),
            NewProduct {
                title: title.to_string(),
                description: None,
                price,
                currency: "USD".to_string(),
                image_url: None,
                stock,
            },
        )
        .await
        .expect("create product")
    }

    pub async fn add_user(&self, email: &str, role: &str) -> User {
        UserStore::create(
            self.store.as_ref(),
            NewUser {
                name: "Test User".to_string(),
                email: email.to_string(),
                password_hash: "unused".to_string(),
                role: role.to_string(),
            },
        )
        .await
        .expect("create user")
    }

    pub fn token_for(&self, user: &User) -> String {
        self.tokens.issue(user).expect("issue token")
    }

    pub async fn checkout(
        &self,
        user: Option<&AuthUser>,
        key: &str,
        request: CheckoutRequest,
    ) -> AppResult<CheckoutResponse> {
        let resp = checkout_service::checkout(&self.state, user, key, request).await?;
        Ok(resp.data.expect("checkout data"))
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router().oneshot(request).await.expect("router response")
    }
}

pub fn build_state<S>(
    store: Arc<S>,
    audit: Arc<dyn AuditLog>,
    gateway: Arc<FakeGateway>,
    tokens: Arc<JwtAuth>,
    checkout: CheckoutConfig,
) -> AppState
where
    S: CatalogStore + OrderStore + ReservationStore + UserStore + 'static,
{
    AppState {
        catalog: store.clone(),
        orders: store.clone(),
        reservations: store.clone(),
        users: store,
        audit,
        gateway,
        auth: tokens.clone(),
        tokens,
        pricing: PricingPolicy::from_config(&checkout),
        checkout,
    }
}

pub fn cart(lines: &[(Uuid, i32)]) -> CheckoutRequest {
    CheckoutRequest {
        items: lines
            .iter()
            .map(|&(product_id, quantity)| CheckoutItem {
                product_id,
                quantity,
            })
            .collect(),
        shipping_address: Some(json!({ "line1": "1 Ferris Way", "city": "Portland" })),
        shipping_method: None,
        discount_code: None,
        currency: None,
        customer_email: Some("buyer@example.com".to_string()),
    }
}

/// A provider notification body for `intent_id`, tagged with `order_id` when given.
pub fn payment_event(event_type: &str, order_id: Option<Uuid>, intent_id: &str) -> Vec<u8> {
    serde_json::to_vec(&event_json(event_type, order_id, intent_id)).expect("serialize event")
}

/// Like [`payment_event`], with the charged amount in minor units.
pub fn payment_event_with_amount(
    event_type: &str,
    order_id: Uuid,
    intent_id: &str,
    amount: i64,
) -> Vec<u8> {
    let mut event = event_json(event_type, Some(order_id), intent_id);
    event["data"]["object"]["amount"] = json!(amount);
    serde_json::to_vec(&event).expect("serialize event")
}

fn event_json(event_type: &str, order_id: Option<Uuid>, intent_id: &str) -> Value {
    let metadata = match order_id {
        Some(id) => json!({ "orderId": id.to_string() }),
        None => json!({}),
    };
    json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": event_type,
        "created": Utc::now().timestamp(),
        "data": {
            "object": {
                "id": intent_id,
                "object": "payment_intent",
                "metadata": metadata,
            }
        }
    })
}

pub fn sign_now(payload: &[u8]) -> String {
    let timestamp = Utc::now().timestamp();
    format!(
        "t={timestamp},v1={}",
        signature::sign(payload, WEBHOOK_SECRET, timestamp)
    )
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}
