use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::config::StripeConfig;

use super::{
    GatewayError, ORDER_ID_METADATA_KEY, PaymentGateway, PaymentIntent, PaymentIntentRequest,
    SignatureError, WebhookEvent, signature,
};

#[derive(Debug, Deserialize)]
struct PaymentIntentResponse {
    id: String,
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// Stripe payment intents over the REST API.
#[derive(Clone)]
pub struct StripeGateway {
    config: StripeConfig,
    client: reqwest::Client,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn read_intent(response: reqwest::Response) -> Result<PaymentIntent, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&body)
                .ok()
                .and_then(|e| e.error.message)
                .unwrap_or(body);
            warn!(status = %status, "stripe api error: {}", message);
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let intent: PaymentIntentResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        let client_secret = intent.client_secret.ok_or_else(|| {
            GatewayError::InvalidResponse(format!("payment intent {} has no client_secret", intent.id))
        })?;
        Ok(PaymentIntent {
            id: intent.id,
            client_secret,
        })
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> &'static str {
        "stripe"
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, GatewayError> {
        let mut params: Vec<(String, String)> = vec![
            ("amount".into(), request.amount_minor_units.to_string()),
            ("currency".into(), request.currency.clone()),
            (
                format!("metadata[{}]", ORDER_ID_METADATA_KEY),
                request.order_id.to_string(),
            ),
            ("automatic_payment_methods[enabled]".into(), "true".into()),
        ];
        if let Some(email) = request.receipt_email.as_ref() {
            params.push(("receipt_email".into(), email.clone()));
        }

        let response = self
            .client
            .post(self.url("/v1/payment_intents"))
            .bearer_auth(&self.config.secret_key)
            .header("Idempotency-Key", format!("order-{}", request.order_id))
            .form(&params)
            .send()
            .await?;

        let intent = Self::read_intent(response).await?;
        info!(payment_intent = %intent.id, "payment intent created");
        Ok(intent)
    }

    #[instrument(skip(self))]
    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, GatewayError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/payment_intents/{}", id)))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;
        Self::read_intent(response).await
    }

    fn construct_event(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookEvent, SignatureError> {
        signature::construct_event(
            payload,
            signature_header,
            &self.config.webhook_secret,
            self.config.webhook_tolerance,
            chrono::Utc::now().timestamp(),
        )
    }
}
