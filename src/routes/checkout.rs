use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};

use crate::{
    dto::checkout::{CheckoutRequest, CheckoutResponse},
    error::AppResult,
    middleware::auth::AuthUser,
    response::ApiResponse,
    services::checkout_service::{self, IDEMPOTENCY_KEY_HEADER, parse_idempotency_key},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(create_checkout))
}

#[utoipa::path(
    post,
    path = "/api/checkout",
    params(
        ("Idempotency-Key" = String, Header, description = "Client key identifying this checkout attempt"),
    ),
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Pending order with a payment intent", body = ApiResponse<CheckoutResponse>),
        (status = 400, description = "Invalid cart or unknown product"),
        (status = 409, description = "Idempotency-Key reused with a different cart"),
        (status = 502, description = "Payment provider unavailable; retry with the same key"),
    ),
    tag = "Checkout"
)]
pub async fn create_checkout(
    State(state): State<AppState>,
    user: Option<AuthUser>,
    headers: HeaderMap,
    Json(payload): Json<CheckoutRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<CheckoutResponse>>)> {
    let key = parse_idempotency_key(
        headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .and_then(|value| value.to_str().ok()),
    )?;
    let resp = checkout_service::checkout(&state, user.as_ref(), &key, payload).await?;
    Ok((StatusCode::CREATED, Json(resp)))
}
