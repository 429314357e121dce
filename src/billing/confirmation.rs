use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;

use super::gateway::{GatewayAdapter, GatewayError};
use super::models::{
    Booking, Entitlement, NewEntitlement, NewSettlement, OrderStatus, PurchaseOrder,
};
use super::notifications::{Notification, NotificationHandle};
use super::store::{InsertOutcome, LedgerStore, SessionBookings};

/// key: purchase-confirmation-errors -> one category per failed confirmation
#[derive(Debug, Error)]
pub enum ConfirmationError {
    #[error("invalid confirmation request: {0}")]
    Validation(String),
    #[error("order not found")]
    NotFound,
    #[error("claimed amount {claimed} does not match order amount {expected}")]
    AmountMismatch { claimed: i64, expected: i64 },
    #[error("payment declined ({code}): {message}")]
    PaymentDeclined { code: String, message: String },
    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("payment gateway not configured: {0}")]
    Configuration(String),
    #[error("order {0} is closed; start a new order")]
    OrderClosed(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmPurchase {
    pub transaction_ref: String,
    pub order_id: String,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmationOutcome {
    pub order_id: String,
    pub entitlement: Entitlement,
    pub booking: Option<Booking>,
    /// True when this call issued nothing and returned an earlier result.
    pub replayed: bool,
}

/// key: purchase-confirmation -> exactly-once entitlement issuance per order id
///
/// The settlement insert is the only exclusion point: concurrent calls may all reach
/// the gateway, but only the one whose settlement lands issues an entitlement. The
/// entitlement is written in the same transaction, so a losing call leaves nothing behind.
#[derive(Clone)]
pub struct PurchaseConfirmationService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn GatewayAdapter>,
    bookings: Arc<dyn SessionBookings>,
    notifications: Option<NotificationHandle>,
    clock: Arc<dyn Clock>,
}

impl PurchaseConfirmationService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn GatewayAdapter>,
        bookings: Arc<dyn SessionBookings>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gateway,
            bookings,
            notifications: None,
            clock,
        }
    }

    pub fn with_notifications(mut self, handle: NotificationHandle) -> Self {
        self.notifications = Some(handle);
        self
    }

    pub async fn confirm(
        &self,
        buyer_id: Uuid,
        request: ConfirmPurchase,
    ) -> Result<ConfirmationOutcome, ConfirmationError> {
        let transaction_ref = request.transaction_ref.trim();
        let order_id = request.order_id.trim();
        if transaction_ref.is_empty() {
            return Err(ConfirmationError::Validation("transaction_ref is required".into()));
        }
        if order_id.is_empty() {
            return Err(ConfirmationError::Validation("order_id is required".into()));
        }
        if request.amount <= 0 {
            return Err(ConfirmationError::Validation("amount must be positive".into()));
        }

        let order = self
            .store
            .order_for_buyer(order_id, buyer_id)
            .await?
            .ok_or(ConfirmationError::NotFound)?;
        if order.amount != request.amount {
            warn!(
                order_id,
                buyer = %buyer_id,
                claimed = request.amount,
                expected = order.amount,
                "purchase confirmation amount mismatch"
            );
            return Err(ConfirmationError::AmountMismatch {
                claimed: request.amount,
                expected: order.amount,
            });
        }

        if order.status != OrderStatus::Pending {
            return self.replay(&order).await;
        }

        let receipt = match self
            .gateway
            .confirm(transaction_ref, order_id, order.amount)
            .await
        {
            Ok(receipt) => receipt,
            Err(GatewayError::Declined { code, message }) => {
                let now = self.clock.now();
                if !self.store.mark_order_failed(order_id, now).await? {
                    // A concurrent call already closed the order; report its outcome.
                    if let Some(current) = self.store.order_for_buyer(order_id, buyer_id).await? {
                        if current.status == OrderStatus::Completed {
                            return self.replay(&current).await;
                        }
                    }
                }
                warn!(order_id, %code, %message, "purchase payment declined");
                return Err(ConfirmationError::PaymentDeclined { code, message });
            }
            Err(GatewayError::ConfigMissing(detail)) => {
                error!(order_id, %detail, "payment gateway not configured");
                return Err(ConfirmationError::Configuration(detail));
            }
            Err(err @ (GatewayError::Unreachable(_) | GatewayError::Unknown(_))) => {
                warn!(order_id, ?err, "purchase confirmation could not reach the gateway");
                return Err(ConfirmationError::GatewayUnavailable(err.message()));
            }
        };

        let now = self.clock.now();
        if self.store.settlement_for_order(order_id).await?.is_some() {
            self.store
                .mark_order_completed(order_id, &receipt.transaction_id, now)
                .await?;
            return self.replay(&order).await;
        }

        let issuance = match self
            .store
            .settle_order(
                NewEntitlement::for_order(&order, self.clock.today()),
                NewSettlement::for_order(&order, &receipt.transaction_id),
                now,
            )
            .await?
        {
            InsertOutcome::Inserted(issuance) => issuance,
            InsertOutcome::Conflict => {
                info!(order_id, "settlement race lost; replaying the winning issuance");
                return self.replay(&order).await;
            }
        };
        let entitlement = issuance.entitlement;

        let booking = self.reserve_session(&order, &entitlement).await;

        if !self
            .store
            .mark_order_completed(order_id, &receipt.transaction_id, now)
            .await?
        {
            warn!(order_id, "order left PENDING before completion was recorded");
        }
        info!(
            order_id,
            buyer = %buyer_id,
            entitlement = %entitlement.id,
            amount = order.amount,
            "purchase confirmed"
        );
        self.notify_completed(&order, &entitlement);

        Ok(ConfirmationOutcome {
            order_id: order.order_id,
            entitlement,
            booking,
            replayed: false,
        })
    }

    /// Returns the result already issued for the order, with no side effects.
    async fn replay(&self, order: &PurchaseOrder) -> Result<ConfirmationOutcome, ConfirmationError> {
        let Some(settlement) = self.store.settlement_for_order(&order.order_id).await? else {
            return match order.status {
                OrderStatus::Failed => Err(ConfirmationError::OrderClosed(order.order_id.clone())),
                _ => Err(ConfirmationError::Internal(anyhow!(
                    "order {} has no settlement",
                    order.order_id
                ))),
            };
        };
        let entitlement = self
            .store
            .entitlement(settlement.entitlement_id)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "settlement for order {} points at missing entitlement {}",
                    order.order_id,
                    settlement.entitlement_id
                )
            })?;
        let booking = match order.session_id {
            Some(session_id) => self.bookings.find(entitlement.id, session_id).await?,
            None => None,
        };

        Ok(ConfirmationOutcome {
            order_id: order.order_id.clone(),
            entitlement,
            booking,
            replayed: true,
        })
    }

    async fn reserve_session(
        &self,
        order: &PurchaseOrder,
        entitlement: &Entitlement,
    ) -> Option<Booking> {
        let session_id = order.session_id?;
        match self
            .bookings
            .reserve(order.buyer_id, entitlement.id, session_id, self.clock.now())
            .await
        {
            Ok(Some(booking)) => Some(booking),
            Ok(None) => {
                warn!(
                    order_id = %order.order_id,
                    entitlement = %entitlement.id,
                    session = %session_id,
                    "entitlement has no uses left for booking"
                );
                None
            }
            Err(err) => {
                error!(
                    ?err,
                    order_id = %order.order_id,
                    session = %session_id,
                    "failed to reserve session for purchase"
                );
                None
            }
        }
    }

    fn notify_completed(&self, order: &PurchaseOrder, entitlement: &Entitlement) {
        let Some(handle) = &self.notifications else {
            return;
        };
        handle.dispatch(Notification {
            buyer_id: order.buyer_id,
            kind: "purchase_completed".into(),
            title: "Purchase confirmed".into(),
            body: format!("Your ticket for order {} is ready.", order.order_id),
            metadata: json!({
                "order_id": order.order_id,
                "entitlement_id": entitlement.id,
                "amount": order.amount,
            }),
        });
    }
}
