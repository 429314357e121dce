//! In-memory ledger used by tests and local runs without Postgres.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use super::models::{
    BillingPlan, Booking, Entitlement, Issuance, NewEntitlement, NewPaymentAttempt,
    NewPurchaseOrder, NewSettlement, OrderStatus, PaymentAttempt, PaymentStatus, PurchaseOrder,
    Settlement, Subscription, SubscriptionStatus, SubscriptionTransition, TicketProduct,
    BOOKING_CONFIRMED, ENTITLEMENT_ACTIVE,
};
use super::store::{InsertOutcome, LedgerStore, SessionBookings};

#[derive(Default)]
struct Tables {
    plans: HashMap<String, BillingPlan>,
    subscriptions: HashMap<Uuid, Subscription>,
    // subscription id -> lease expiry
    claims: HashMap<Uuid, DateTime<Utc>>,
    attempts: Vec<PaymentAttempt>,
    products: HashMap<Uuid, TicketProduct>,
    orders: HashMap<String, PurchaseOrder>,
    entitlements: HashMap<Uuid, Entitlement>,
    settlements: HashMap<String, Settlement>,
    bookings: Vec<Booking>,
    webhook_events: HashSet<String>,
}

/// Every table lives behind one lock so multi-row operations are atomic, which is what
/// the Postgres constraints give the real store.
#[derive(Default)]
pub struct MemoryLedgerStore {
    tables: Mutex<Tables>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_plan(&self, plan: BillingPlan) {
        self.tables().plans.insert(plan.id.clone(), plan);
    }

    pub fn insert_subscription(&self, subscription: Subscription) {
        self.tables()
            .subscriptions
            .insert(subscription.id, subscription);
    }

    pub fn insert_product(&self, product: TicketProduct) {
        self.tables().products.insert(product.id, product);
    }

    pub fn insert_order(&self, order: PurchaseOrder) {
        self.tables().orders.insert(order.order_id.clone(), order);
    }

    /// Seeds a historical attempt as-is, keeping its id and timestamps.
    pub fn insert_attempt(&self, attempt: PaymentAttempt) {
        self.tables().attempts.push(attempt);
    }

    pub fn attempts_for(&self, subscription_id: Uuid) -> Vec<PaymentAttempt> {
        self.tables()
            .attempts
            .iter()
            .filter(|attempt| attempt.subscription_id == subscription_id)
            .cloned()
            .collect()
    }

    pub fn order(&self, order_id: &str) -> Option<PurchaseOrder> {
        self.tables().orders.get(order_id).cloned()
    }

    pub fn entitlements_for_order(&self, order_id: &str) -> Vec<Entitlement> {
        self.tables()
            .entitlements
            .values()
            .filter(|entitlement| entitlement.order_id == order_id)
            .cloned()
            .collect()
    }

    pub fn settlement_count(&self, order_id: &str) -> usize {
        usize::from(self.tables().settlements.contains_key(order_id))
    }

    pub fn bookings(&self) -> Vec<Booking> {
        self.tables().bookings.clone()
    }
}

fn filtered(tables: &Tables, predicate: impl Fn(&Subscription) -> bool) -> Vec<Subscription> {
    let mut selected: Vec<Subscription> = tables
        .subscriptions
        .values()
        .filter(|subscription| predicate(subscription))
        .cloned()
        .collect();
    selected.sort_by_key(|subscription| subscription.created_at);
    selected
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn plan(&self, plan_id: &str) -> Result<Option<BillingPlan>> {
        Ok(self.tables().plans.get(plan_id).cloned())
    }

    async fn subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>> {
        Ok(self.tables().subscriptions.get(&subscription_id).cloned())
    }

    async fn due_subscriptions(&self, today: NaiveDate) -> Result<Vec<Subscription>> {
        Ok(filtered(&self.tables(), |s| s.is_renewal_due(today)))
    }

    async fn due_trials(&self, today: NaiveDate) -> Result<Vec<Subscription>> {
        Ok(filtered(&self.tables(), |s| s.is_trial_due(today)))
    }

    async fn lapsed_grace_subscriptions(&self, today: NaiveDate) -> Result<Vec<Subscription>> {
        Ok(filtered(&self.tables(), |s| s.is_grace_lapsed(today)))
    }

    async fn transition_subscription(
        &self,
        subscription_id: Uuid,
        expected: SubscriptionStatus,
        transition: SubscriptionTransition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables();
        let Some(subscription) = tables.subscriptions.get_mut(&subscription_id) else {
            return Ok(false);
        };
        if subscription.status != expected {
            return Ok(false);
        }

        subscription.status = transition.target_status();
        subscription.updated_at = now;
        match transition {
            SubscriptionTransition::Renew {
                period_start,
                period_end,
            } => {
                subscription.current_period_start = Some(period_start);
                subscription.current_period_end = Some(period_end);
                subscription.grace_period_end = None;
            }
            SubscriptionTransition::Cancel => subscription.canceled_at = Some(now),
            SubscriptionTransition::PastDue { grace_period_end } => {
                subscription.grace_period_end = Some(grace_period_end);
            }
            SubscriptionTransition::Expire => {}
        }
        tables.claims.remove(&subscription_id);
        Ok(true)
    }

    async fn claim_subscription(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables();
        let unchanged = tables.subscriptions.get(&subscription.id).map_or(false, |stored| {
            stored.status == subscription.status
                && stored.current_period_end == subscription.current_period_end
        });
        let leased = tables
            .claims
            .get(&subscription.id)
            .map_or(false, |until| *until > now);
        if !unchanged || leased {
            return Ok(false);
        }
        tables.claims.insert(subscription.id, lease_until);
        Ok(true)
    }

    async fn request_cancellation(&self, subscription_id: Uuid) -> Result<Option<Subscription>> {
        let mut tables = self.tables();
        let Some(subscription) = tables.subscriptions.get_mut(&subscription_id) else {
            return Ok(None);
        };
        if subscription.status.is_terminal() {
            return Ok(None);
        }
        subscription.cancel_at_period_end = true;
        subscription.updated_at = Utc::now();
        Ok(Some(subscription.clone()))
    }

    async fn revoke_billing_credential(
        &self,
        customer_ref: &str,
        grace_period_end: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut touched = 0;
        for subscription in self.tables().subscriptions.values_mut() {
            if subscription.customer_ref.as_deref() != Some(customer_ref) {
                continue;
            }
            subscription.billing_credential = None;
            subscription.updated_at = now;
            if matches!(
                subscription.status,
                SubscriptionStatus::Trial | SubscriptionStatus::Active
            ) {
                subscription.status = SubscriptionStatus::PastDue;
                subscription.grace_period_end = Some(grace_period_end);
            }
            touched += 1;
        }
        Ok(touched)
    }

    async fn completed_attempt_count(&self, subscription_id: Uuid) -> Result<u64> {
        Ok(self
            .tables()
            .attempts
            .iter()
            .filter(|attempt| {
                attempt.subscription_id == subscription_id
                    && attempt.status == PaymentStatus::Completed
            })
            .count() as u64)
    }

    async fn record_attempt(&self, attempt: NewPaymentAttempt) -> Result<PaymentAttempt> {
        let mut tables = self.tables();
        if tables
            .attempts
            .iter()
            .any(|existing| existing.gateway_order_id == attempt.gateway_order_id)
        {
            return Err(anyhow!(
                "duplicate gateway order id {}",
                attempt.gateway_order_id
            ));
        }
        let now = Utc::now();
        let record = PaymentAttempt {
            id: Uuid::new_v4(),
            subscription_id: attempt.subscription_id,
            academy_id: attempt.academy_id,
            amount: attempt.amount,
            billing_cycle: attempt.billing_cycle,
            period_start: attempt.period.map(|(start, _)| start),
            period_end: attempt.period.map(|(_, end)| end),
            gateway_transaction_id: attempt.gateway_transaction_id,
            gateway_order_id: attempt.gateway_order_id,
            status: attempt.status,
            failure_code: attempt.failure_code,
            failure_message: attempt.failure_message,
            retry_count: 0,
            next_retry_at: attempt.next_retry_at,
            paid_at: attempt.paid_at,
            // Keeps newest-first ordering stable when several rows land in one tick.
            created_at: now.max(
                tables
                    .attempts
                    .iter()
                    .map(|existing| existing.created_at)
                    .max()
                    .map(|latest| latest + chrono::Duration::microseconds(1))
                    .unwrap_or(now),
            ),
        };
        tables.attempts.push(record.clone());
        Ok(record)
    }

    async fn retryable_attempts(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
    ) -> Result<Vec<PaymentAttempt>> {
        let mut due: Vec<PaymentAttempt> = self
            .tables()
            .attempts
            .iter()
            .filter(|attempt| {
                attempt.status == PaymentStatus::Failed
                    && attempt.retry_count < max_retries
                    && attempt.next_retry_at.map_or(false, |at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(due)
    }

    async fn claim_retry(
        &self,
        attempt_id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables();
        match tables
            .attempts
            .iter_mut()
            .find(|attempt| attempt.id == attempt_id)
        {
            Some(attempt)
                if attempt.status == PaymentStatus::Failed
                    && attempt.next_retry_at.map_or(false, |at| at <= now) =>
            {
                attempt.next_retry_at = Some(lease_until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_retry_failure(
        &self,
        attempt_id: Uuid,
        max_retries: i32,
        next_retry_at: DateTime<Utc>,
        failure_code: &str,
        failure_message: &str,
    ) -> Result<Option<i32>> {
        let mut tables = self.tables();
        let Some(attempt) = tables
            .attempts
            .iter_mut()
            .find(|attempt| attempt.id == attempt_id)
        else {
            return Ok(None);
        };
        if attempt.status != PaymentStatus::Failed || attempt.retry_count >= max_retries {
            return Ok(None);
        }
        attempt.retry_count += 1;
        attempt.next_retry_at = Some(next_retry_at);
        attempt.failure_code = Some(failure_code.to_string());
        attempt.failure_message = Some(failure_message.to_string());
        Ok(Some(attempt.retry_count))
    }

    async fn clear_retry_schedule(&self, subscription_id: Uuid) -> Result<u64> {
        let mut cleared = 0;
        for attempt in self.tables().attempts.iter_mut() {
            if attempt.subscription_id == subscription_id
                && attempt.status == PaymentStatus::Failed
                && attempt.next_retry_at.is_some()
            {
                attempt.next_retry_at = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn attempt(&self, attempt_id: Uuid) -> Result<Option<PaymentAttempt>> {
        Ok(self
            .tables()
            .attempts
            .iter()
            .find(|attempt| attempt.id == attempt_id)
            .cloned())
    }

    async fn attempt_by_gateway_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<PaymentAttempt>> {
        Ok(self
            .tables()
            .attempts
            .iter()
            .find(|attempt| attempt.gateway_order_id == gateway_order_id)
            .cloned())
    }

    async fn set_attempt_status(
        &self,
        attempt_id: Uuid,
        status: PaymentStatus,
        gateway_transaction_id: Option<&str>,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut tables = self.tables();
        let attempt = tables
            .attempts
            .iter_mut()
            .find(|attempt| attempt.id == attempt_id)
            .ok_or_else(|| anyhow!("payment attempt {attempt_id} not found"))?;
        attempt.status = status;
        if let Some(transaction_id) = gateway_transaction_id {
            attempt.gateway_transaction_id = Some(transaction_id.to_string());
        }
        attempt.paid_at = paid_at;
        if status != PaymentStatus::Failed {
            attempt.next_retry_at = None;
        }
        Ok(())
    }

    async fn product(&self, product_id: Uuid) -> Result<Option<TicketProduct>> {
        Ok(self.tables().products.get(&product_id).cloned())
    }

    async fn create_order(
        &self,
        order: NewPurchaseOrder,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome<PurchaseOrder>> {
        let mut tables = self.tables();
        if tables.orders.contains_key(&order.order_id) {
            return Ok(InsertOutcome::Conflict);
        }
        let record = PurchaseOrder {
            id: Uuid::new_v4(),
            order_id: order.order_id,
            buyer_id: order.buyer_id,
            academy_id: order.academy_id,
            product_id: order.product_id,
            amount: order.amount,
            status: OrderStatus::Pending,
            session_id: order.session_id,
            uses: order.uses,
            valid_days: order.valid_days,
            gateway_transaction_id: None,
            created_at: now,
            updated_at: now,
        };
        tables.orders.insert(record.order_id.clone(), record.clone());
        Ok(InsertOutcome::Inserted(record))
    }

    async fn order_for_buyer(
        &self,
        order_id: &str,
        buyer_id: Uuid,
    ) -> Result<Option<PurchaseOrder>> {
        Ok(self
            .tables()
            .orders
            .get(order_id)
            .filter(|order| order.buyer_id == buyer_id)
            .cloned())
    }

    async fn mark_order_failed(&self, order_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables();
        match tables.orders.get_mut(order_id) {
            Some(order) if order.status == OrderStatus::Pending => {
                order.status = OrderStatus::Failed;
                order.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_order_completed(
        &self,
        order_id: &str,
        gateway_transaction_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables();
        match tables.orders.get_mut(order_id) {
            Some(order) if order.status == OrderStatus::Pending => {
                order.status = OrderStatus::Completed;
                order.gateway_transaction_id = Some(gateway_transaction_id.to_string());
                order.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn entitlement(&self, entitlement_id: Uuid) -> Result<Option<Entitlement>> {
        Ok(self.tables().entitlements.get(&entitlement_id).cloned())
    }

    async fn settlement_for_order(&self, order_id: &str) -> Result<Option<Settlement>> {
        Ok(self.tables().settlements.get(order_id).cloned())
    }

    async fn settle_order(
        &self,
        entitlement: NewEntitlement,
        settlement: NewSettlement,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome<Issuance>> {
        let mut tables = self.tables();
        if tables.settlements.contains_key(&settlement.order_id) {
            return Ok(InsertOutcome::Conflict);
        }
        let entitlement = Entitlement {
            id: Uuid::new_v4(),
            buyer_id: entitlement.buyer_id,
            academy_id: entitlement.academy_id,
            product_id: entitlement.product_id,
            order_id: entitlement.order_id,
            remaining_uses: entitlement.remaining_uses,
            start_date: entitlement.start_date,
            expiry_date: entitlement.expiry_date,
            status: ENTITLEMENT_ACTIVE.to_string(),
            created_at: now,
        };
        let settlement = Settlement {
            id: Uuid::new_v4(),
            order_id: settlement.order_id,
            buyer_id: settlement.buyer_id,
            academy_id: settlement.academy_id,
            product_id: settlement.product_id,
            entitlement_id: entitlement.id,
            amount: settlement.amount,
            gateway_transaction_id: settlement.gateway_transaction_id,
            created_at: now,
        };
        tables
            .entitlements
            .insert(entitlement.id, entitlement.clone());
        tables
            .settlements
            .insert(settlement.order_id.clone(), settlement.clone());
        Ok(InsertOutcome::Inserted(Issuance {
            entitlement,
            settlement,
        }))
    }

    async fn webhook_event_seen(&self, event_id: &str) -> Result<bool> {
        Ok(self.tables().webhook_events.contains(event_id))
    }

    async fn record_webhook_event(
        &self,
        event_id: &str,
        _event_type: Option<&str>,
        _payload: serde_json::Value,
    ) -> Result<bool> {
        Ok(self.tables().webhook_events.insert(event_id.to_string()))
    }
}

#[async_trait]
impl SessionBookings for MemoryLedgerStore {
    async fn find(&self, entitlement_id: Uuid, session_id: Uuid) -> Result<Option<Booking>> {
        Ok(self
            .tables()
            .bookings
            .iter()
            .find(|booking| {
                booking.entitlement_id == entitlement_id && booking.session_id == session_id
            })
            .cloned())
    }

    async fn reserve(
        &self,
        buyer_id: Uuid,
        entitlement_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Booking>> {
        let mut tables = self.tables();
        if let Some(existing) = tables.bookings.iter().find(|booking| {
            booking.entitlement_id == entitlement_id && booking.session_id == session_id
        }) {
            return Ok(Some(existing.clone()));
        }

        let entitlement = tables
            .entitlements
            .get_mut(&entitlement_id)
            .ok_or_else(|| anyhow!("entitlement {entitlement_id} not found"))?;
        match entitlement.remaining_uses {
            Some(remaining) if remaining <= 0 => return Ok(None),
            Some(remaining) => entitlement.remaining_uses = Some(remaining - 1),
            None => {}
        }

        let booking = Booking {
            id: Uuid::new_v4(),
            buyer_id,
            entitlement_id,
            session_id,
            status: BOOKING_CONFIRMED.to_string(),
            created_at: now,
        };
        tables.bookings.push(booking.clone());
        Ok(Some(booking))
    }
}
