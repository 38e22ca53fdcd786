use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
};

use crate::{
    dto::webhooks::WebhookAck,
    error::AppResult,
    services::webhook_service::{SIGNATURE_HEADER, handle_payment_event},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/stripe", post(stripe_webhook))
}

// The body is taken as raw bytes; the signature covers them exactly as sent.
#[utoipa::path(
    post,
    path = "/api/webhooks/stripe",
    params(
        ("Stripe-Signature" = String, Header, description = "t=<timestamp>,v1=<hex hmac>"),
    ),
    request_body(content = String, content_type = "application/json"),
    responses(
        (status = 200, description = "Event acknowledged", body = WebhookAck),
        (status = 400, description = "Missing or invalid signature"),
        (status = 500, description = "Local persistence failed; the provider should retry"),
    ),
    tag = "Webhooks"
)]
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    handle_payment_event(&state, &body, signature).await?;
    Ok(Json(WebhookAck { received: true }))
}
