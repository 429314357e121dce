use axum::{
    body::Bytes,
    extract::Extension,
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::billing::{BillingContext, PaymentStatus, SubscriptionTransition};
use crate::error::{AppError, AppResult};

const SIGNATURE_HEADERS: &[&str] = &["tosspayments-webhook-signature", "x-webhook-signature"];

/// key: webhooks-billing -> provider event envelope
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentEvent {
    event_id: Option<String>,
    event_type: Option<String>,
    #[serde(default)]
    data: Option<PaymentEventData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentEventData {
    payment_key: Option<String>,
    order_id: Option<String>,
    status: Option<String>,
    customer_key: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// Signatures are only enforced when both the secret and a signature header are present.
fn verify_signature(secret: Option<&str>, headers: &HeaderMap, body: &[u8]) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    let signature = SIGNATURE_HEADERS
        .iter()
        .find_map(|name| headers.get(*name).and_then(|value| value.to_str().ok()));
    match signature {
        Some(signature) => signature.trim() == sha256_hex(&[secret.as_bytes(), body]),
        None => true,
    }
}

fn map_payment_status(status: &str) -> Option<PaymentStatus> {
    match status {
        "DONE" => Some(PaymentStatus::Completed),
        "CANCELED" => Some(PaymentStatus::Refunded),
        "ABORTED" => Some(PaymentStatus::Failed),
        _ => None,
    }
}

pub async fn payment_webhook(
    Extension(ctx): Extension<BillingContext>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    apply_payment_event(&ctx, &headers, &body).await.map(Json)
}

/// key: webhooks-billing -> idempotent provider event processing
///
/// The event id is recorded only after its side effects succeed, so a delivery that
/// failed halfway is applied in full when the provider resends it. Every side effect is
/// itself idempotent, which covers two deliveries racing past the seen check.
pub async fn apply_payment_event(
    ctx: &BillingContext,
    headers: &HeaderMap,
    body: &[u8],
) -> AppResult<WebhookAck> {
    if !verify_signature(ctx.webhook_secret.as_deref(), headers, body) {
        tracing::warn!("payment webhook signature mismatch");
        return Err(AppError::Unauthorized);
    }

    let event: PaymentEvent = serde_json::from_slice(body)
        .map_err(|err| AppError::BadRequest(format!("invalid webhook payload: {err}")))?;
    let event_id = event
        .event_id
        .clone()
        .unwrap_or_else(|| sha256_hex(&[body]));
    let data = event.data.unwrap_or_default();
    let snapshot = json!({
        "paymentKey": data.payment_key,
        "orderId": data.order_id,
        "status": data.status,
    });

    if ctx.store.webhook_event_seen(&event_id).await? {
        tracing::info!(%event_id, "duplicate payment webhook event, skipping");
        return Ok(WebhookAck {
            received: true,
            duplicate: true,
        });
    }

    tracing::info!(
        %event_id,
        event_type = ?event.event_type,
        order_id = ?data.order_id,
        "payment webhook received"
    );

    match event.event_type.as_deref() {
        Some("PAYMENT_STATUS_CHANGED") => apply_status_change(ctx, &data).await?,
        Some("BILLING_KEY_DELETED") => {
            if let Some(customer_key) = data.customer_key.as_deref() {
                let grace_period_end = ctx.policy.grace_end(ctx.clock.today());
                let touched = ctx
                    .store
                    .revoke_billing_credential(customer_key, grace_period_end, ctx.clock.now())
                    .await?;
                tracing::warn!(
                    customer = customer_key,
                    touched,
                    "billing credential deleted at provider"
                );
            }
        }
        other => tracing::debug!(event_type = ?other, "unhandled payment webhook event"),
    }

    let recorded = ctx
        .store
        .record_webhook_event(&event_id, event.event_type.as_deref(), snapshot)
        .await?;
    if !recorded {
        tracing::debug!(%event_id, "payment webhook event recorded by a concurrent delivery");
    }

    Ok(WebhookAck {
        received: true,
        duplicate: false,
    })
}

async fn apply_status_change(ctx: &BillingContext, data: &PaymentEventData) -> AppResult<()> {
    let (Some(order_id), Some(status)) = (data.order_id.as_deref(), data.status.as_deref()) else {
        return Ok(());
    };
    let Some(status) = map_payment_status(status) else {
        tracing::debug!(order_id, status, "payment status not tracked");
        return Ok(());
    };
    let Some(attempt) = ctx.store.attempt_by_gateway_order(order_id).await? else {
        tracing::debug!(order_id, "webhook order does not match a subscription payment");
        return Ok(());
    };

    let now = ctx.clock.now();
    let paid_at = (status == PaymentStatus::Completed).then_some(now);
    ctx.store
        .set_attempt_status(attempt.id, status, data.payment_key.as_deref(), paid_at)
        .await?;

    if status == PaymentStatus::Refunded {
        if let Some(subscription) = ctx.store.subscription(attempt.subscription_id).await? {
            if subscription.status.is_terminal() {
                return Ok(());
            }
            let canceled = ctx
                .store
                .transition_subscription(
                    subscription.id,
                    subscription.status,
                    SubscriptionTransition::Cancel,
                    now,
                )
                .await?;
            tracing::info!(
                subscription = %subscription.id,
                canceled,
                "subscription canceled after refund"
            );
        }
    }
    Ok(())
}
