use chrono::Utc;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::checkout::{CheckoutRequest, CheckoutResponse},
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{NewOrder, Order, OrderStatus},
    payments::{GatewayError, PaymentIntent, PaymentIntentRequest},
    response::ApiResponse,
    services::pricing::{CartLine, PricingError, PricingRequest, normalize_currency, price_cart},
    state::AppState,
    store::{AuditEntry, StoreError},
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const IDEMPOTENCY_KEY_MAX_LEN: usize = 255;

/// Validates the client-supplied idempotency key.
pub fn parse_idempotency_key(raw: Option<&str>) -> AppResult<String> {
    let key = raw
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| AppError::BadRequest("Idempotency-Key header is required".into()))?;

    if key.len() > IDEMPOTENCY_KEY_MAX_LEN || !key.chars().all(|c| c.is_ascii_graphic()) {
        return Err(AppError::BadRequest(format!(
            "Idempotency-Key must be 1 to {} visible ASCII characters",
            IDEMPOTENCY_KEY_MAX_LEN
        )));
    }
    Ok(key.to_string())
}

/// Prices the cart, persists a pending order and opens a payment intent for it.
///
/// Calls sharing an idempotency key resolve to the same order: a retry after a
/// gateway failure reuses the pending order instead of creating a new one.
#[tracing::instrument(
    skip(state, user, payload),
    fields(idempotency_key = %idempotency_key, order_id = tracing::field::Empty)
)]
pub async fn checkout(
    state: &AppState,
    user: Option<&AuthUser>,
    idempotency_key: &str,
    payload: CheckoutRequest,
) -> AppResult<ApiResponse<CheckoutResponse>> {
    let currency = normalize_currency(
        payload
            .currency
            .as_deref()
            .unwrap_or(&state.checkout.default_currency),
    )?;
    let lines: Vec<CartLine> = payload
        .items
        .iter()
        .map(|item| CartLine {
            product_id: item.product_id,
            quantity: item.quantity,
        })
        .collect();
    validate_lines(&lines)?;

    let order = match state.orders.find_by_idempotency_key(idempotency_key).await? {
        Some(existing) => {
            ensure_same_cart(&existing, &lines, &currency, &payload)?;
            renew_hold(state, &existing).await?;
            tracing::info!(order_id = %existing.id, "resuming checkout for existing order");
            existing
        }
        None => place_order(state, user, idempotency_key, &payload, &lines, &currency).await?,
    };
    tracing::Span::current().record("order_id", tracing::field::display(order.id));

    let first_intent = order.payment.is_none();
    let intent = request_payment(state, &order).await?;

    if first_intent {
        log_audit(
            state.audit.as_ref(),
            AuditEntry::new("checkout", "orders")
                .by(user.map(|u| u.user_id))
                .with_metadata(serde_json::json!({
                    "orderId": order.id,
                    "total": order.total_minor_units,
                    "currency": order.currency,
                })),
        )
        .await;
    }

    Ok(ApiResponse::ok(
        "Checkout created",
        CheckoutResponse {
            client_secret: intent.client_secret,
            order_id: order.id,
        },
    ))
}

fn validate_lines(lines: &[CartLine]) -> AppResult<()> {
    if lines.is_empty() {
        return Err(PricingError::EmptyCart.into());
    }
    if let Some(line) = lines.iter().find(|l| l.quantity <= 0) {
        return Err(PricingError::InvalidQuantity(line.product_id).into());
    }
    Ok(())
}

/// A reused key must describe the same cart, and the order must still be payable.
fn ensure_same_cart(
    order: &Order,
    lines: &[CartLine],
    currency: &str,
    payload: &CheckoutRequest,
) -> AppResult<()> {
    if order.status != OrderStatus::Pending {
        return Err(AppError::Conflict(format!(
            "Order {} for this Idempotency-Key is already {}",
            order.id, order.status
        )));
    }

    let requested: Vec<(Uuid, i32)> = lines.iter().map(|l| (l.product_id, l.quantity)).collect();
    if order.cart_lines() != requested
        || order.currency != currency
        || order.shipping_method != payload.shipping_method
        || order.discount_code != payload.discount_code
    {
        return Err(AppError::Conflict(
            "Idempotency-Key was already used with a different cart".into(),
        ));
    }
    Ok(())
}

async fn place_order(
    state: &AppState,
    user: Option<&AuthUser>,
    idempotency_key: &str,
    payload: &CheckoutRequest,
    lines: &[CartLine],
    currency: &str,
) -> AppResult<Order> {
    let mut ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
    ids.sort_unstable();
    ids.dedup();
    let products = state.catalog.find_by_ids(&ids).await?;

    let priced = price_cart(
        &PricingRequest {
            lines,
            currency,
            shipping_method: payload.shipping_method.as_deref(),
            discount_code: payload.discount_code.as_deref(),
        },
        &products,
        &state.pricing,
    )?;

    let customer_email = payload
        .customer_email
        .clone()
        .or_else(|| user.map(|u| u.email.clone()));

    let draft = NewOrder {
        user_id: user.map(|u| u.user_id),
        customer_email,
        items: priced.items,
        subtotal_minor_units: priced.subtotal_minor_units,
        shipping_minor_units: priced.shipping_minor_units,
        tax_minor_units: priced.tax_minor_units,
        discount_minor_units: priced.discount_minor_units,
        total_minor_units: priced.total_minor_units,
        currency: currency.to_string(),
        shipping_address: payload.shipping_address.clone(),
        shipping_method: payload.shipping_method.clone(),
        discount_code: payload.discount_code.clone(),
        idempotency_key: Some(idempotency_key.to_string()),
        reserve_until: Utc::now() + state.checkout.reservation_ttl,
    };

    match state.orders.create(draft).await {
        Ok(order) => {
            tracing::info!(
                order_id = %order.id,
                total = order.total_minor_units,
                currency = %order.currency,
                "order created"
            );
            Ok(order)
        }
        // A concurrent request with the same key won the insert.
        Err(err) if err.is_conflict() => {
            let existing = state
                .orders
                .find_by_idempotency_key(idempotency_key)
                .await?
                .ok_or(AppError::OrderPersistence(err))?;
            ensure_same_cart(&existing, lines, currency, payload)?;
            Ok(existing)
        }
        Err(StoreError::InsufficientStock(product_id)) => Err(insufficient_stock(product_id)),
        Err(err) => Err(AppError::OrderPersistence(err)),
    }
}

/// Holds of a resumed order may have lapsed; take them again for a fresh TTL.
async fn renew_hold(state: &AppState, order: &Order) -> AppResult<()> {
    let until = Utc::now() + state.checkout.reservation_ttl;
    state
        .reservations
        .renew(order.id, until)
        .await
        .map_err(|err| match err {
            StoreError::InsufficientStock(product_id) => insufficient_stock(product_id),
            err => err.into(),
        })
}

fn insufficient_stock(product_id: Uuid) -> AppError {
    AppError::BadRequest(format!("Insufficient stock for product {product_id}"))
}

async fn request_payment(state: &AppState, order: &Order) -> AppResult<PaymentIntent> {
    let gateway = state.gateway.as_ref();
    let call = async {
        match order.payment.as_ref() {
            Some(payment) => {
                gateway
                    .retrieve_payment_intent(&payment.provider_payment_id)
                    .await
            }
            None => {
                gateway
                    .create_payment_intent(&PaymentIntentRequest {
                        amount_minor_units: order.total_minor_units,
                        currency: order.currency.to_lowercase(),
                        order_id: order.id,
                        receipt_email: order.customer_email.clone(),
                    })
                    .await
            }
        }
    };

    let intent = match tokio::time::timeout(state.checkout.payment_timeout, call).await {
        Ok(Ok(intent)) => intent,
        Ok(Err(source)) => {
            tracing::warn!(order_id = %order.id, error = %source, "payment intent request failed");
            return Err(AppError::PaymentGateway {
                order_id: order.id,
                source,
            });
        }
        Err(_) => {
            tracing::warn!(order_id = %order.id, "payment intent request timed out");
            return Err(AppError::PaymentGateway {
                order_id: order.id,
                source: GatewayError::Timeout,
            });
        }
    };

    if order.payment.is_none() {
        let stored = state
            .orders
            .attach_payment(order.id, gateway.provider(), &intent.id)
            .await
            .map_err(AppError::OrderPersistence)?
            .ok_or(AppError::NotFound)?;

        if let Some(payment) = stored.payment.as_ref() {
            if payment.provider_payment_id != intent.id {
                tracing::warn!(
                    order_id = %order.id,
                    stored = %payment.provider_payment_id,
                    created = %intent.id,
                    "order already carries a different payment intent"
                );
            }
        }
    }

    Ok(intent)
}
