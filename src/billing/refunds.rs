use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;

use super::gateway::{GatewayAdapter, GatewayError};
use super::models::{PaymentAttempt, PaymentStatus, SubscriptionTransition};
use super::store::LedgerStore;

const DEFAULT_REFUND_REASON: &str = "admin refund";

#[derive(Debug, Error)]
pub enum RefundError {
    #[error("invalid refund request: {0}")]
    Validation(String),
    #[error("payment not found for subscription")]
    NotFound,
    #[error("payment cannot be refunded: {0}")]
    NotRefundable(String),
    #[error("refund rejected by gateway ({code}): {message}")]
    Declined { code: String, message: String },
    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("payment gateway not configured: {0}")]
    Configuration(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundPayment {
    pub payment_id: Option<Uuid>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundOutcome {
    pub payment: PaymentAttempt,
    pub subscription_canceled: bool,
}

/// key: subscription-refund -> operator refund of one settled subscription payment
///
/// The gateway cancel runs first; the ledger is only touched once the provider has
/// accepted it. A full refund also cancels the subscription.
pub async fn refund_subscription_payment(
    store: &dyn LedgerStore,
    gateway: &dyn GatewayAdapter,
    clock: &dyn Clock,
    subscription_id: Uuid,
    request: RefundPayment,
) -> Result<RefundOutcome, RefundError> {
    let payment_id = request
        .payment_id
        .ok_or_else(|| RefundError::Validation("payment_id is required".into()))?;
    let attempt = store
        .attempt(payment_id)
        .await?
        .filter(|attempt| attempt.subscription_id == subscription_id)
        .ok_or(RefundError::NotFound)?;

    if attempt.status != PaymentStatus::Completed {
        return Err(RefundError::NotRefundable(format!(
            "payment is {}",
            attempt.status.as_str()
        )));
    }
    let transaction_id = attempt
        .gateway_transaction_id
        .as_deref()
        .ok_or_else(|| RefundError::NotRefundable("payment has no gateway transaction".into()))?;
    if let Some(amount) = request.amount {
        if amount <= 0 || amount > attempt.amount {
            return Err(RefundError::Validation(format!(
                "amount must be between 1 and {}",
                attempt.amount
            )));
        }
    }
    let reason = request
        .cancel_reason
        .as_deref()
        .map(str::trim)
        .filter(|reason| !reason.is_empty())
        .unwrap_or(DEFAULT_REFUND_REASON);

    match gateway.cancel(transaction_id, reason, request.amount).await {
        Ok(_) => {}
        Err(GatewayError::Declined { code, message }) => {
            warn!(payment = %attempt.id, %code, %message, "gateway rejected refund");
            return Err(RefundError::Declined { code, message });
        }
        Err(GatewayError::ConfigMissing(detail)) => {
            return Err(RefundError::Configuration(detail));
        }
        Err(err @ (GatewayError::Unreachable(_) | GatewayError::Unknown(_))) => {
            warn!(payment = %attempt.id, ?err, "refund could not reach the gateway");
            return Err(RefundError::GatewayUnavailable(err.message()));
        }
    }

    let now = clock.now();
    store
        .set_attempt_status(attempt.id, PaymentStatus::Refunded, None, attempt.paid_at)
        .await?;

    let full_refund = request.amount.map_or(true, |amount| amount == attempt.amount);
    let mut subscription_canceled = false;
    if full_refund {
        if let Some(subscription) = store.subscription(subscription_id).await? {
            if !subscription.status.is_terminal() {
                subscription_canceled = store
                    .transition_subscription(
                        subscription.id,
                        subscription.status,
                        SubscriptionTransition::Cancel,
                        now,
                    )
                    .await?;
            }
        }
    }

    info!(
        subscription = %subscription_id,
        payment = %attempt.id,
        amount = request.amount.unwrap_or(attempt.amount),
        subscription_canceled,
        "subscription payment refunded"
    );

    let payment = store
        .attempt(attempt.id)
        .await?
        .unwrap_or(PaymentAttempt {
            status: PaymentStatus::Refunded,
            ..attempt
        });
    Ok(RefundOutcome {
        payment,
        subscription_canceled,
    })
}
