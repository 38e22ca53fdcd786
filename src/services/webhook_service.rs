use crate::{
    audit::log_audit,
    error::AppResult,
    models::{Order, OrderStatus},
    payments::{EVENT_PAYMENT_FAILED, EVENT_PAYMENT_SUCCEEDED, SignatureError},
    state::AppState,
    store::{AuditEntry, PaymentOutcome, Transition},
};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// What a delivery did to local state. Every variant is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The order left `pending` because of this event.
    Applied(OrderStatus),
    /// The order already reflects this outcome.
    Duplicate,
    /// The order settled with a different outcome first.
    Superseded,
    /// No order could be matched to the event.
    Unmatched,
    /// The event type is not reconciled.
    Ignored,
}

/// Authenticates a provider notification and reconciles it onto its order.
///
/// Authentication failures surface as errors so the delivery is rejected;
/// everything after that is acknowledged unless local persistence fails.
#[tracing::instrument(
    skip(state, payload, signature),
    fields(event_id = tracing::field::Empty, event_type = tracing::field::Empty)
)]
pub async fn handle_payment_event(
    state: &AppState,
    payload: &[u8],
    signature: Option<&str>,
) -> AppResult<WebhookOutcome> {
    let signature = signature.ok_or(SignatureError::MissingHeader)?;
    let event = state
        .gateway
        .construct_event(payload, signature)
        .inspect_err(|err| tracing::warn!(error = %err, "rejected webhook delivery"))?;

    let span = tracing::Span::current();
    span.record("event_id", event.id.as_str());
    span.record("event_type", event.event_type.as_str());

    let status = match event.event_type.as_str() {
        EVENT_PAYMENT_SUCCEEDED => OrderStatus::Paid,
        EVENT_PAYMENT_FAILED => OrderStatus::Cancelled,
        _ => {
            tracing::debug!("event type not reconciled");
            return Ok(WebhookOutcome::Ignored);
        }
    };

    let Some(intent) = event.payment_intent() else {
        tracing::warn!("event carries no payment intent object");
        return Ok(WebhookOutcome::Unmatched);
    };
    let Some(order_id) = intent.order_id() else {
        tracing::warn!(payment_intent = %intent.id, "payment intent has no usable order id");
        return Ok(WebhookOutcome::Unmatched);
    };

    let outcome = PaymentOutcome {
        status,
        success: status == OrderStatus::Paid,
        provider: state.gateway.provider().to_string(),
        provider_payment_id: intent.id.clone(),
        raw: event.data.object.clone(),
    };

    match state.orders.complete_payment(order_id, outcome).await? {
        Transition::NotFound => {
            tracing::warn!(%order_id, "webhook references an unknown order");
            Ok(WebhookOutcome::Unmatched)
        }
        Transition::Applied(order) => {
            if let Some(payment) = order.payment.as_ref() {
                if payment.provider_payment_id != intent.id {
                    tracing::warn!(
                        %order_id,
                        stored = %payment.provider_payment_id,
                        received = %intent.id,
                        "payment intent differs from the one recorded at checkout"
                    );
                }
            }
            if let Some(amount) = intent.amount.filter(|a| *a != order.total_minor_units) {
                tracing::warn!(
                    %order_id,
                    expected = order.total_minor_units,
                    received = amount,
                    "payment intent amount differs from the order total"
                );
            }
            settle_stock(state, &order).await?;
            record_outcome(state, &order, &intent.id).await;
            tracing::info!(%order_id, status = %order.status, "order payment reconciled");
            Ok(WebhookOutcome::Applied(order.status))
        }
        // Redelivery of the outcome already stored. Settling again is a no-op once
        // the reservations are gone and completes the work if a previous attempt
        // failed after the transition.
        Transition::Unchanged(order) if order.status == status => {
            if settle_stock(state, &order).await? > 0 {
                tracing::warn!(%order_id, "completed settlement left over by an earlier delivery");
                record_outcome(state, &order, &intent.id).await;
            }
            tracing::info!(%order_id, status = %order.status, "duplicate webhook delivery");
            Ok(WebhookOutcome::Duplicate)
        }
        Transition::Unchanged(order) => {
            tracing::info!(
                %order_id,
                status = %order.status,
                received = %status,
                "order already settled with a different outcome"
            );
            Ok(WebhookOutcome::Superseded)
        }
    }
}

/// Finalizes or releases the order's reservations and returns how many it settled.
async fn settle_stock(state: &AppState, order: &Order) -> AppResult<u64> {
    let settled = match order.status {
        OrderStatus::Paid => {
            let settlement = state.reservations.finalize(order.id).await?;
            if settlement.consumed > 0 {
                tracing::debug!(
                    order_id = %order.id,
                    reservations = settlement.consumed,
                    "reservations finalized"
                );
            }
            if !settlement.short.is_empty() {
                tracing::warn!(
                    order_id = %order.id,
                    products = ?settlement.short,
                    "paid order exceeds remaining stock"
                );
                log_audit(
                    state.audit.as_ref(),
                    AuditEntry::new("order_stock_short", "orders")
                        .by(order.user_id)
                        .with_metadata(serde_json::json!({
                            "orderId": order.id,
                            "productIds": settlement.short,
                        })),
                )
                .await;
            }
            settlement.consumed
        }
        OrderStatus::Cancelled => {
            let released = state.reservations.release(order.id).await?;
            if released > 0 {
                tracing::debug!(order_id = %order.id, reservations = released, "reservations released");
            }
            released
        }
        _ => 0,
    };
    Ok(settled)
}

async fn record_outcome(state: &AppState, order: &Order, provider_payment_id: &str) {
    let action = match order.status {
        OrderStatus::Paid => "order_paid",
        _ => "order_payment_failed",
    };
    log_audit(
        state.audit.as_ref(),
        AuditEntry::new(action, "orders")
            .by(order.user_id)
            .with_metadata(serde_json::json!({
                "orderId": order.id,
                "paymentIntentId": provider_payment_id,
                "total": order.total_minor_units,
            })),
    )
    .await;
}
