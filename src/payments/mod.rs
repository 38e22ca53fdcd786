use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub mod signature;
pub mod stripe;

pub use signature::SignatureError;
pub use stripe::StripeGateway;

/// Metadata key carrying the order id on every payment intent.
pub const ORDER_ID_METADATA_KEY: &str = "orderId";

pub const EVENT_PAYMENT_SUCCEEDED: &str = "payment_intent.succeeded";
pub const EVENT_PAYMENT_FAILED: &str = "payment_intent.payment_failed";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment provider request failed")]
    Http(#[from] reqwest::Error),

    #[error("payment provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("payment provider timed out")]
    Timeout,

    #[error("unexpected payment provider response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone)]
pub struct PaymentIntentRequest {
    pub amount_minor_units: i64,
    /// Lower-case ISO currency code.
    pub currency: String,
    pub order_id: Uuid,
    pub receipt_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    /// Charged amount in minor units.
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl WebhookEvent {
    pub fn payment_intent(&self) -> Option<PaymentIntentObject> {
        serde_json::from_value(self.data.object.clone()).ok()
    }
}

impl PaymentIntentObject {
    pub fn order_id(&self) -> Option<Uuid> {
        self.metadata
            .get(ORDER_ID_METADATA_KEY)
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, GatewayError>;

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, GatewayError>;

    /// Authenticates a webhook delivery over its unparsed body.
    fn construct_event(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookEvent, SignatureError>;
}
