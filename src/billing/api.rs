use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::{header::AUTHORIZATION, HeaderMap},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

use super::confirmation::{ConfirmPurchase, ConfirmationOutcome, PurchaseConfirmationService};
use super::gateway::GatewayAdapter;
use super::models::Subscription;
use super::notifications::NotificationHandle;
use super::orders::{create_purchase_order, CreatePurchaseOrder, CreatedOrder};
use super::refunds::{refund_subscription_payment, RefundOutcome, RefundPayment};
use super::scheduler::{run_billing_tick, BillingPolicy, SweepReport};
use super::store::{LedgerStore, SessionBookings};

const CANCEL_ROLES: &[&str] = &["academy_owner", "super_admin"];
const REFUND_ROLES: &[&str] = &["super_admin"];

/// key: billing-context -> shared handles for billing routes
#[derive(Clone)]
pub struct BillingContext {
    pub store: Arc<dyn LedgerStore>,
    pub gateway: Arc<dyn GatewayAdapter>,
    pub clock: Arc<dyn Clock>,
    pub policy: BillingPolicy,
    pub confirmations: PurchaseConfirmationService,
    pub cron_secret: Option<String>,
    pub webhook_secret: Option<String>,
}

impl BillingContext {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn GatewayAdapter>,
        bookings: Arc<dyn SessionBookings>,
        clock: Arc<dyn Clock>,
        policy: BillingPolicy,
    ) -> Self {
        let confirmations = PurchaseConfirmationService::new(
            store.clone(),
            gateway.clone(),
            bookings,
            clock.clone(),
        );
        Self {
            store,
            gateway,
            clock,
            policy,
            confirmations,
            cron_secret: None,
            webhook_secret: None,
        }
    }

    pub fn with_secrets(
        mut self,
        cron_secret: Option<String>,
        webhook_secret: Option<String>,
    ) -> Self {
        self.cron_secret = cron_secret;
        self.webhook_secret = webhook_secret;
        self
    }

    pub fn with_notifications(mut self, handle: NotificationHandle) -> Self {
        self.confirmations = self.confirmations.with_notifications(handle);
        self
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

/// key: billing-api -> cron trigger
///
/// An unset secret locks the trigger rather than opening it.
pub async fn run_cron(
    Extension(ctx): Extension<BillingContext>,
    headers: HeaderMap,
) -> AppResult<Json<SweepReport>> {
    let expected = ctx.cron_secret.as_deref().ok_or_else(|| {
        tracing::error!("CRON_SECRET is not configured; refusing billing trigger");
        AppError::Unauthorized
    })?;
    if bearer_token(&headers) != Some(expected) {
        return Err(AppError::Unauthorized);
    }

    let report = run_billing_tick(
        ctx.store.as_ref(),
        ctx.gateway.as_ref(),
        ctx.clock.as_ref(),
        ctx.policy,
    )
    .await;
    Ok(Json(report))
}

pub async fn create_order(
    Extension(ctx): Extension<BillingContext>,
    user: AuthUser,
    Json(payload): Json<CreatePurchaseOrder>,
) -> AppResult<Json<CreatedOrder>> {
    let order =
        create_purchase_order(ctx.store.as_ref(), ctx.clock.as_ref(), user.user_id, payload)
            .await?;
    Ok(Json(order))
}

pub async fn confirm_purchase(
    Extension(ctx): Extension<BillingContext>,
    user: AuthUser,
    Json(payload): Json<ConfirmPurchase>,
) -> AppResult<Json<ConfirmationOutcome>> {
    let outcome = ctx.confirmations.confirm(user.user_id, payload).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
pub struct CancellationEnvelope {
    pub subscription: Subscription,
}

pub async fn cancel_subscription(
    Extension(ctx): Extension<BillingContext>,
    user: AuthUser,
    Path(subscription_id): Path<Uuid>,
) -> AppResult<Json<CancellationEnvelope>> {
    if !user.has_any_role(CANCEL_ROLES) {
        return Err(AppError::Forbidden);
    }

    let existing = ctx
        .store
        .subscription(subscription_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if existing.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "subscription is already {}",
            existing.status
        )));
    }

    let subscription = ctx
        .store
        .request_cancellation(subscription_id)
        .await?
        .ok_or_else(|| AppError::Conflict("subscription closed concurrently".into()))?;
    tracing::info!(
        subscription = %subscription.id,
        user = %user.user_id,
        "cancellation at period end requested"
    );
    Ok(Json(CancellationEnvelope { subscription }))
}

pub async fn refund_payment(
    Extension(ctx): Extension<BillingContext>,
    user: AuthUser,
    Path(subscription_id): Path<Uuid>,
    Json(payload): Json<RefundPayment>,
) -> AppResult<Json<RefundOutcome>> {
    if !user.has_any_role(REFUND_ROLES) {
        return Err(AppError::Forbidden);
    }
    let outcome = refund_subscription_payment(
        ctx.store.as_ref(),
        ctx.gateway.as_ref(),
        ctx.clock.as_ref(),
        subscription_id,
        payload,
    )
    .await?;
    tracing::info!(
        subscription = %subscription_id,
        payment = %outcome.payment.id,
        user = %user.user_id,
        "refund issued by operator"
    );
    Ok(Json(outcome))
}
