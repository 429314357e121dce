#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use academy_billing::billing::models::{
    NewEntitlement, NewPaymentAttempt, NewPurchaseOrder, NewSettlement,
};
use academy_billing::billing::{
    BillingCycle, BillingPlan, Booking, ChargeReceipt, Entitlement, GatewayAdapter, GatewayError,
    InsertOutcome, Issuance, LedgerStore, MemoryLedgerStore, OrderStatus, PaymentAttempt,
    PaymentStatus, PurchaseOrder, SessionBookings, Settlement, StoredCharge, Subscription,
    SubscriptionStatus, SubscriptionTransition, TicketProduct,
};
use academy_billing::clock::FixedClock;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use uuid::Uuid;

pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

pub fn clock_at(instant: DateTime<Utc>) -> Arc<FixedClock> {
    Arc::new(FixedClock::new(instant))
}

pub fn plan(id: &str, monthly_price: i64, annual_price_per_month: i64) -> BillingPlan {
    BillingPlan {
        id: id.to_string(),
        display_name: id.to_uppercase(),
        monthly_price,
        annual_price_per_month,
    }
}

/// Active monthly subscription on `plan_id` whose period ended the day before `today`.
pub fn due_subscription(plan_id: &str, today: NaiveDate, credential: &str) -> Subscription {
    let created_at = at(2023, 1, 1, 0);
    Subscription {
        id: Uuid::new_v4(),
        academy_id: Uuid::new_v4(),
        plan_id: plan_id.to_string(),
        billing_cycle: BillingCycle::Monthly,
        status: SubscriptionStatus::Active,
        current_period_start: Some(today.pred_opt().unwrap() - chrono::Duration::days(30)),
        current_period_end: today.pred_opt(),
        trial_ends_at: None,
        grace_period_end: None,
        cancel_at_period_end: false,
        discount_percent: None,
        first_period_free: false,
        billing_credential: Some(credential.to_string()),
        customer_ref: Some(format!("cust_{credential}")),
        canceled_at: None,
        created_at,
        updated_at: created_at,
    }
}

/// Trial subscription whose trial ended on `today`.
pub fn due_trial(plan_id: &str, today: NaiveDate, credential: &str) -> Subscription {
    Subscription {
        status: SubscriptionStatus::Trial,
        current_period_start: None,
        current_period_end: None,
        trial_ends_at: Some(today),
        ..due_subscription(plan_id, today, credential)
    }
}

pub fn completed_attempt(subscription: &Subscription, amount: i64) -> PaymentAttempt {
    PaymentAttempt {
        id: Uuid::new_v4(),
        subscription_id: subscription.id,
        academy_id: subscription.academy_id,
        amount,
        billing_cycle: subscription.billing_cycle,
        period_start: subscription.current_period_start,
        period_end: subscription.current_period_end,
        gateway_transaction_id: Some(format!("tx_{}", Uuid::new_v4().simple())),
        gateway_order_id: format!("auto_{}", Uuid::new_v4().simple()),
        status: PaymentStatus::Completed,
        failure_code: None,
        failure_message: None,
        retry_count: 0,
        next_retry_at: None,
        paid_at: Some(at(2024, 1, 1, 0)),
        created_at: at(2024, 1, 1, 0),
    }
}

pub fn failed_attempt(
    subscription: &Subscription,
    amount: i64,
    retry_count: i32,
    next_retry_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
) -> PaymentAttempt {
    PaymentAttempt {
        status: PaymentStatus::Failed,
        gateway_transaction_id: None,
        period_start: None,
        period_end: None,
        failure_code: Some("REJECT_CARD_PAYMENT".into()),
        failure_message: Some("limit exceeded".into()),
        retry_count,
        next_retry_at: Some(next_retry_at),
        paid_at: None,
        created_at,
        ..completed_attempt(subscription, amount)
    }
}

pub fn pending_order(buyer_id: Uuid, order_id: &str, amount: i64) -> PurchaseOrder {
    PurchaseOrder {
        id: Uuid::new_v4(),
        order_id: order_id.to_string(),
        buyer_id,
        academy_id: Uuid::new_v4(),
        product_id: Uuid::new_v4(),
        amount,
        status: OrderStatus::Pending,
        session_id: None,
        uses: Some(10),
        valid_days: Some(90),
        gateway_transaction_id: None,
        created_at: at(2024, 3, 1, 0),
        updated_at: at(2024, 3, 1, 0),
    }
}

pub fn ticket_product(academy_id: Uuid, price: i64) -> TicketProduct {
    TicketProduct {
        id: Uuid::new_v4(),
        academy_id,
        name: "10-class pass".to_string(),
        price,
        uses: Some(10),
        valid_days: Some(90),
        is_on_sale: true,
        is_public: true,
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    Approve,
    Decline(&'static str),
    Unreachable,
    ConfigMissing,
    Unknown,
}

impl Reply {
    fn into_result(self, transaction_id: String) -> Result<ChargeReceipt, GatewayError> {
        match self {
            Reply::Approve => Ok(ChargeReceipt { transaction_id }),
            Reply::Decline(code) => Err(GatewayError::Declined {
                code: code.to_string(),
                message: "declined by issuer".to_string(),
            }),
            Reply::Unreachable => Err(GatewayError::Unreachable("connect timeout".into())),
            Reply::ConfigMissing => Err(GatewayError::ConfigMissing("secret key is not set".into())),
            Reply::Unknown => Err(GatewayError::Unknown("status 418".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCall {
    pub key: String,
    pub order_id: String,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelCall {
    pub transaction_id: String,
    pub reason: String,
    pub amount: Option<i64>,
}

/// Gateway double. Replies are scripted per credential (stored charges), per
/// transaction reference (confirmations) or per transaction id (cancels); anything
/// unscripted gets the fallback.
pub struct ScriptedGateway {
    fallback: Mutex<Reply>,
    scripted: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<GatewayCall>>,
    cancels: Mutex<Vec<CancelCall>>,
    latency: Option<Duration>,
}

impl ScriptedGateway {
    pub fn replying(fallback: Reply) -> Self {
        Self {
            fallback: Mutex::new(fallback),
            scripted: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    pub fn approving() -> Self {
        Self::replying(Reply::Approve)
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn script(&self, key: &str, replies: Vec<Reply>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn set_fallback(&self, reply: Reply) {
        *self.fallback.lock().unwrap() = reply;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, key: &str) -> Vec<GatewayCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.key == key)
            .collect()
    }

    pub fn cancels(&self) -> Vec<CancelCall> {
        self.cancels.lock().unwrap().clone()
    }

    async fn next_reply(&self, key: &str) -> Reply {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.scripted
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.fallback.lock().unwrap().clone())
    }

    async fn answer(
        &self,
        key: &str,
        order_id: &str,
        amount: i64,
    ) -> Result<ChargeReceipt, GatewayError> {
        self.calls.lock().unwrap().push(GatewayCall {
            key: key.to_string(),
            order_id: order_id.to_string(),
            amount,
        });
        self.next_reply(key).await.into_result(format!("tx_{key}"))
    }
}

#[async_trait]
impl GatewayAdapter for ScriptedGateway {
    async fn confirm(
        &self,
        transaction_ref: &str,
        order_id: &str,
        amount: i64,
    ) -> Result<ChargeReceipt, GatewayError> {
        self.answer(transaction_ref, order_id, amount).await
    }

    async fn charge_stored(&self, charge: &StoredCharge<'_>) -> Result<ChargeReceipt, GatewayError> {
        self.answer(charge.credential, charge.order_id, charge.amount)
            .await
    }

    async fn cancel(
        &self,
        transaction_id: &str,
        reason: &str,
        amount: Option<i64>,
    ) -> Result<ChargeReceipt, GatewayError> {
        self.cancels.lock().unwrap().push(CancelCall {
            transaction_id: transaction_id.to_string(),
            reason: reason.to_string(),
            amount,
        });
        self.next_reply(transaction_id)
            .await
            .into_result(transaction_id.to_string())
    }
}

/// Ledger wrapper for race and failure tests. Yields to the scheduler right after the
/// settlement re-check, so concurrent confirmations interleave before issuance, and can
/// be told to fail the next N attempt status updates.
pub struct InterleavingStore {
    pub inner: Arc<MemoryLedgerStore>,
    failing_status_updates: AtomicUsize,
}

impl InterleavingStore {
    pub fn new(inner: Arc<MemoryLedgerStore>) -> Self {
        Self {
            inner,
            failing_status_updates: AtomicUsize::new(0),
        }
    }

    pub fn fail_status_updates(&self, times: usize) {
        self.failing_status_updates.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for InterleavingStore {
    async fn plan(&self, plan_id: &str) -> Result<Option<BillingPlan>> {
        self.inner.plan(plan_id).await
    }

    async fn subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>> {
        self.inner.subscription(subscription_id).await
    }

    async fn due_subscriptions(&self, today: NaiveDate) -> Result<Vec<Subscription>> {
        self.inner.due_subscriptions(today).await
    }

    async fn due_trials(&self, today: NaiveDate) -> Result<Vec<Subscription>> {
        self.inner.due_trials(today).await
    }

    async fn lapsed_grace_subscriptions(&self, today: NaiveDate) -> Result<Vec<Subscription>> {
        self.inner.lapsed_grace_subscriptions(today).await
    }

    async fn transition_subscription(
        &self,
        subscription_id: Uuid,
        expected: SubscriptionStatus,
        transition: SubscriptionTransition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner
            .transition_subscription(subscription_id, expected, transition, now)
            .await
    }

    async fn claim_subscription(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner
            .claim_subscription(subscription, now, lease_until)
            .await
    }

    async fn request_cancellation(&self, subscription_id: Uuid) -> Result<Option<Subscription>> {
        self.inner.request_cancellation(subscription_id).await
    }

    async fn revoke_billing_credential(
        &self,
        customer_ref: &str,
        grace_period_end: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.inner
            .revoke_billing_credential(customer_ref, grace_period_end, now)
            .await
    }

    async fn completed_attempt_count(&self, subscription_id: Uuid) -> Result<u64> {
        self.inner.completed_attempt_count(subscription_id).await
    }

    async fn record_attempt(&self, attempt: NewPaymentAttempt) -> Result<PaymentAttempt> {
        self.inner.record_attempt(attempt).await
    }

    async fn retryable_attempts(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
    ) -> Result<Vec<PaymentAttempt>> {
        self.inner.retryable_attempts(now, max_retries).await
    }

    async fn claim_retry(
        &self,
        attempt_id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.claim_retry(attempt_id, now, lease_until).await
    }

    async fn record_retry_failure(
        &self,
        attempt_id: Uuid,
        max_retries: i32,
        next_retry_at: DateTime<Utc>,
        failure_code: &str,
        failure_message: &str,
    ) -> Result<Option<i32>> {
        self.inner
            .record_retry_failure(
                attempt_id,
                max_retries,
                next_retry_at,
                failure_code,
                failure_message,
            )
            .await
    }

    async fn clear_retry_schedule(&self, subscription_id: Uuid) -> Result<u64> {
        self.inner.clear_retry_schedule(subscription_id).await
    }

    async fn attempt(&self, attempt_id: Uuid) -> Result<Option<PaymentAttempt>> {
        self.inner.attempt(attempt_id).await
    }

    async fn attempt_by_gateway_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<PaymentAttempt>> {
        self.inner.attempt_by_gateway_order(gateway_order_id).await
    }

    async fn set_attempt_status(
        &self,
        attempt_id: Uuid,
        status: PaymentStatus,
        gateway_transaction_id: Option<&str>,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let failing = self
            .failing_status_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("connection reset while updating payment {attempt_id}"));
        }
        self.inner
            .set_attempt_status(attempt_id, status, gateway_transaction_id, paid_at)
            .await
    }

    async fn product(&self, product_id: Uuid) -> Result<Option<TicketProduct>> {
        self.inner.product(product_id).await
    }

    async fn create_order(
        &self,
        order: NewPurchaseOrder,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome<PurchaseOrder>> {
        self.inner.create_order(order, now).await
    }

    async fn order_for_buyer(
        &self,
        order_id: &str,
        buyer_id: Uuid,
    ) -> Result<Option<PurchaseOrder>> {
        self.inner.order_for_buyer(order_id, buyer_id).await
    }

    async fn mark_order_failed(&self, order_id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.inner.mark_order_failed(order_id, now).await
    }

    async fn mark_order_completed(
        &self,
        order_id: &str,
        gateway_transaction_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner
            .mark_order_completed(order_id, gateway_transaction_id, now)
            .await
    }

    async fn entitlement(&self, entitlement_id: Uuid) -> Result<Option<Entitlement>> {
        self.inner.entitlement(entitlement_id).await
    }

    async fn settlement_for_order(&self, order_id: &str) -> Result<Option<Settlement>> {
        let settlement = self.inner.settlement_for_order(order_id).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        settlement
    }

    async fn settle_order(
        &self,
        entitlement: NewEntitlement,
        settlement: NewSettlement,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome<Issuance>> {
        self.inner.settle_order(entitlement, settlement, now).await
    }

    async fn webhook_event_seen(&self, event_id: &str) -> Result<bool> {
        self.inner.webhook_event_seen(event_id).await
    }

    async fn record_webhook_event(
        &self,
        event_id: &str,
        event_type: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<bool> {
        self.inner
            .record_webhook_event(event_id, event_type, payload)
            .await
    }
}

#[async_trait]
impl SessionBookings for InterleavingStore {
    async fn find(&self, entitlement_id: Uuid, session_id: Uuid) -> Result<Option<Booking>> {
        self.inner.find(entitlement_id, session_id).await
    }

    async fn reserve(
        &self,
        buyer_id: Uuid,
        entitlement_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Booking>> {
        self.inner
            .reserve(buyer_id, entitlement_id, session_id, now)
            .await
    }
}
