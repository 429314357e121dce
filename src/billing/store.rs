use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use super::models::{
    BillingPlan, Booking, Entitlement, Issuance, NewEntitlement, NewPaymentAttempt,
    NewPurchaseOrder, NewSettlement, PaymentAttempt, PaymentStatus, PurchaseOrder, Settlement,
    Subscription, SubscriptionStatus, SubscriptionTransition, TicketProduct,
};

/// Result of an insert guarded by a uniqueness constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome<T> {
    Inserted(T),
    Conflict,
}

/// key: ledger-store -> single source of truth for billing state
///
/// Subscription writes are compare-and-set on the status the caller last observed, so
/// overlapping sweeps degrade to no-ops instead of double transitions. Sweeps claim a
/// work item before any gateway call; only the claim holder may charge it.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // subscriptions

    async fn plan(&self, plan_id: &str) -> Result<Option<BillingPlan>>;

    async fn subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>>;

    /// Active, period ended on or before `today`, credential present.
    async fn due_subscriptions(&self, today: NaiveDate) -> Result<Vec<Subscription>>;

    /// Trial, trial ended on or before `today`, credential present.
    async fn due_trials(&self, today: NaiveDate) -> Result<Vec<Subscription>>;

    /// Past due with a grace period that ended before `today`.
    async fn lapsed_grace_subscriptions(&self, today: NaiveDate) -> Result<Vec<Subscription>>;

    /// Returns `false` when the stored status no longer equals `expected`.
    async fn transition_subscription(
        &self,
        subscription_id: Uuid,
        expected: SubscriptionStatus,
        transition: SubscriptionTransition,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Leases the subscription for one charge. Succeeds only while status and period end
    /// still match the snapshot and no unexpired lease exists. Any transition releases it.
    async fn claim_subscription(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Flags a live subscription for cancellation at period end.
    async fn request_cancellation(&self, subscription_id: Uuid) -> Result<Option<Subscription>>;

    /// Drops the credential of every subscription bound to `customer_ref`; trial and
    /// active ones move to past_due with the given grace end. Returns the number of
    /// subscriptions touched.
    async fn revoke_billing_credential(
        &self,
        customer_ref: &str,
        grace_period_end: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    // payment attempts

    async fn completed_attempt_count(&self, subscription_id: Uuid) -> Result<u64>;

    async fn record_attempt(&self, attempt: NewPaymentAttempt) -> Result<PaymentAttempt>;

    /// Failed attempts due for retry, newest first.
    async fn retryable_attempts(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
    ) -> Result<Vec<PaymentAttempt>>;

    /// Leases a due failed attempt by pushing `next_retry_at` to `lease_until`. `false`
    /// when another sweep already holds it or the attempt is no longer due.
    async fn claim_retry(
        &self,
        attempt_id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Atomically bumps `retry_count` while it is below `max_retries`. Returns the new
    /// count, or `None` when the row was already terminal.
    async fn record_retry_failure(
        &self,
        attempt_id: Uuid,
        max_retries: i32,
        next_retry_at: DateTime<Utc>,
        failure_code: &str,
        failure_message: &str,
    ) -> Result<Option<i32>>;

    /// Clears `next_retry_at` on every failed attempt of the subscription.
    async fn clear_retry_schedule(&self, subscription_id: Uuid) -> Result<u64>;

    async fn attempt(&self, attempt_id: Uuid) -> Result<Option<PaymentAttempt>>;

    async fn attempt_by_gateway_order(&self, gateway_order_id: &str)
        -> Result<Option<PaymentAttempt>>;

    async fn set_attempt_status(
        &self,
        attempt_id: Uuid,
        status: PaymentStatus,
        gateway_transaction_id: Option<&str>,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    // purchase orders

    async fn product(&self, product_id: Uuid) -> Result<Option<TicketProduct>>;

    /// Inserts a PENDING order. Must be enforced by a unique constraint on `order_id`.
    async fn create_order(
        &self,
        order: NewPurchaseOrder,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome<PurchaseOrder>>;

    async fn order_for_buyer(&self, order_id: &str, buyer_id: Uuid)
        -> Result<Option<PurchaseOrder>>;

    /// PENDING -> FAILED. Returns `false` if the order had already left PENDING.
    async fn mark_order_failed(&self, order_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// PENDING -> COMPLETED. Returns `false` if the order had already left PENDING.
    async fn mark_order_completed(
        &self,
        order_id: &str,
        gateway_transaction_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    // entitlements and settlements

    async fn entitlement(&self, entitlement_id: Uuid) -> Result<Option<Entitlement>>;

    async fn settlement_for_order(&self, order_id: &str) -> Result<Option<Settlement>>;

    /// Writes the entitlement and its settlement in one transaction. `Conflict` when a
    /// settlement for the order already exists; nothing is written in that case.
    async fn settle_order(
        &self,
        entitlement: NewEntitlement,
        settlement: NewSettlement,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome<Issuance>>;

    // provider webhooks

    async fn webhook_event_seen(&self, event_id: &str) -> Result<bool>;

    /// Marks the event processed. Returns `false` when the event id was already recorded.
    async fn record_webhook_event(
        &self,
        event_id: &str,
        event_type: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<bool>;
}

/// key: booking-collaborator -> downstream session reservation
///
/// Safe to call repeatedly: an existing booking for the same entitlement and session is
/// returned instead of inserting a second one.
#[async_trait]
pub trait SessionBookings: Send + Sync {
    async fn find(&self, entitlement_id: Uuid, session_id: Uuid) -> Result<Option<Booking>>;

    /// Consumes one use of the entitlement and reserves the session. `None` when the
    /// entitlement has no uses left.
    async fn reserve(
        &self,
        buyer_id: Uuid,
        entitlement_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Booking>>;
}
