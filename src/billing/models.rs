use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// key: billing-subscription-status -> lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// No sweep or webhook moves a subscription out of these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::Expired
        )
    }
}

impl FromStr for SubscriptionStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(anyhow!("unknown subscription status `{other}`")),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Annual,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Annual => "annual",
        }
    }

    fn months(&self) -> u32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Annual => 12,
        }
    }

    /// One full cycle starting at `start`. Month ends clamp (Jan 31 -> Feb 28/29).
    pub fn period_from(&self, start: NaiveDate) -> (NaiveDate, NaiveDate) {
        let end = start
            .checked_add_months(Months::new(self.months()))
            .unwrap_or(start);
        (start, end)
    }
}

impl FromStr for BillingCycle {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "monthly" => Ok(BillingCycle::Monthly),
            "annual" => Ok(BillingCycle::Annual),
            other => Err(anyhow!("unknown billing cycle `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(anyhow!("unknown payment status `{other}`")),
        }
    }
}

/// key: purchase-order-status -> PENDING,COMPLETED,FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(OrderStatus::Pending),
            "COMPLETED" => Ok(OrderStatus::Completed),
            "FAILED" => Ok(OrderStatus::Failed),
            other => Err(anyhow!("unknown order status `{other}`")),
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// key: billing-models -> plans,subscriptions,payments
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BillingPlan {
    pub id: String,
    pub display_name: String,
    pub monthly_price: i64,
    pub annual_price_per_month: i64,
}

impl BillingPlan {
    pub fn base_amount(&self, cycle: BillingCycle) -> i64 {
        match cycle {
            BillingCycle::Monthly => self.monthly_price,
            BillingCycle::Annual => self.annual_price_per_month.saturating_mul(12),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub academy_id: Uuid,
    pub plan_id: String,
    pub billing_cycle: BillingCycle,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<NaiveDate>,
    pub current_period_end: Option<NaiveDate>,
    pub trial_ends_at: Option<NaiveDate>,
    pub grace_period_end: Option<NaiveDate>,
    pub cancel_at_period_end: bool,
    pub discount_percent: Option<i32>,
    pub first_period_free: bool,
    #[serde(skip_serializing)]
    pub billing_credential: Option<String>,
    pub customer_ref: Option<String>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_renewal_due(&self, today: NaiveDate) -> bool {
        self.status == SubscriptionStatus::Active
            && self.billing_credential.is_some()
            && self.current_period_end.map_or(false, |end| end <= today)
    }

    pub fn is_trial_due(&self, today: NaiveDate) -> bool {
        self.status == SubscriptionStatus::Trial
            && self.billing_credential.is_some()
            && self.trial_ends_at.map_or(false, |end| end <= today)
    }

    pub fn is_grace_lapsed(&self, today: NaiveDate) -> bool {
        self.status == SubscriptionStatus::PastDue
            && self.grace_period_end.map_or(false, |end| end < today)
    }
}

/// key: billing-subscription-transition -> compare-and-set writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionTransition {
    /// Status becomes active with the given period; grace is cleared.
    Renew {
        period_start: NaiveDate,
        period_end: NaiveDate,
    },
    Cancel,
    PastDue {
        grace_period_end: NaiveDate,
    },
    Expire,
}

impl SubscriptionTransition {
    pub fn target_status(&self) -> SubscriptionStatus {
        match self {
            SubscriptionTransition::Renew { .. } => SubscriptionStatus::Active,
            SubscriptionTransition::Cancel => SubscriptionStatus::Canceled,
            SubscriptionTransition::PastDue { .. } => SubscriptionStatus::PastDue,
            SubscriptionTransition::Expire => SubscriptionStatus::Expired,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub academy_id: Uuid,
    pub amount: i64,
    pub billing_cycle: BillingCycle,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub gateway_transaction_id: Option<String>,
    pub gateway_order_id: String,
    pub status: PaymentStatus,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPaymentAttempt {
    pub subscription_id: Uuid,
    pub academy_id: Uuid,
    pub amount: i64,
    pub billing_cycle: BillingCycle,
    pub period: Option<(NaiveDate, NaiveDate)>,
    pub gateway_transaction_id: Option<String>,
    pub gateway_order_id: String,
    pub status: PaymentStatus,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl NewPaymentAttempt {
    pub fn completed(
        subscription: &Subscription,
        amount: i64,
        period: (NaiveDate, NaiveDate),
        gateway_order_id: String,
        gateway_transaction_id: Option<String>,
        paid_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subscription_id: subscription.id,
            academy_id: subscription.academy_id,
            amount,
            billing_cycle: subscription.billing_cycle,
            period: Some(period),
            gateway_transaction_id,
            gateway_order_id,
            status: PaymentStatus::Completed,
            failure_code: None,
            failure_message: None,
            next_retry_at: None,
            paid_at: Some(paid_at),
        }
    }

    pub fn failed(
        subscription: &Subscription,
        amount: i64,
        gateway_order_id: String,
        failure_code: String,
        failure_message: String,
        next_retry_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subscription_id: subscription.id,
            academy_id: subscription.academy_id,
            amount,
            billing_cycle: subscription.billing_cycle,
            period: None,
            gateway_transaction_id: None,
            gateway_order_id,
            status: PaymentStatus::Failed,
            failure_code: Some(failure_code),
            failure_message: Some(failure_message),
            next_retry_at: Some(next_retry_at),
            paid_at: None,
        }
    }
}

/// key: purchase-order-model -> one logical one-off purchase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub id: Uuid,
    pub order_id: String,
    pub buyer_id: Uuid,
    pub academy_id: Uuid,
    pub product_id: Uuid,
    pub amount: i64,
    pub status: OrderStatus,
    pub session_id: Option<Uuid>,
    pub uses: Option<i32>,
    pub valid_days: Option<i32>,
    pub gateway_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Order as requested by the buyer, before the ledger assigns a row id.
#[derive(Debug, Clone)]
pub struct NewPurchaseOrder {
    pub order_id: String,
    pub buyer_id: Uuid,
    pub academy_id: Uuid,
    pub product_id: Uuid,
    pub amount: i64,
    pub session_id: Option<Uuid>,
    pub uses: Option<i32>,
    pub valid_days: Option<i32>,
}

impl NewPurchaseOrder {
    pub fn for_product(
        order_id: String,
        buyer_id: Uuid,
        product: &TicketProduct,
        session_id: Option<Uuid>,
    ) -> Self {
        Self {
            order_id,
            buyer_id,
            academy_id: product.academy_id,
            product_id: product.id,
            amount: product.price,
            session_id,
            uses: product.uses,
            valid_days: product.valid_days,
        }
    }
}

/// key: ticket-product-model -> sellable ticket and the terms it grants
#[derive(Debug, Clone, FromRow, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketProduct {
    pub id: Uuid,
    pub academy_id: Uuid,
    pub name: String,
    pub price: i64,
    pub uses: Option<i32>,
    pub valid_days: Option<i32>,
    pub is_on_sale: bool,
    pub is_public: bool,
}

pub const ENTITLEMENT_ACTIVE: &str = "ACTIVE";

/// key: entitlement-model -> issued ticket
#[derive(Debug, Clone, FromRow, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub academy_id: Uuid,
    pub product_id: Uuid,
    pub order_id: String,
    pub remaining_uses: Option<i32>,
    pub start_date: NaiveDate,
    pub expiry_date: Option<NaiveDate>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEntitlement {
    pub buyer_id: Uuid,
    pub academy_id: Uuid,
    pub product_id: Uuid,
    pub order_id: String,
    pub remaining_uses: Option<i32>,
    pub start_date: NaiveDate,
    pub expiry_date: Option<NaiveDate>,
}

impl NewEntitlement {
    pub fn for_order(order: &PurchaseOrder, today: NaiveDate) -> Self {
        let expiry_date = match order.valid_days {
            Some(days) if days > 0 => today.checked_add_days(chrono::Days::new(days as u64)),
            Some(_) => today.checked_add_months(Months::new(12)),
            None => None,
        };
        Self {
            buyer_id: order.buyer_id,
            academy_id: order.academy_id,
            product_id: order.product_id,
            order_id: order.order_id.clone(),
            remaining_uses: order.uses,
            start_date: today,
            expiry_date,
        }
    }
}

/// key: settlement-model -> revenue record, unique per order id
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Settlement {
    pub id: Uuid,
    pub order_id: String,
    pub buyer_id: Uuid,
    pub academy_id: Uuid,
    pub product_id: Uuid,
    pub entitlement_id: Uuid,
    pub amount: i64,
    pub gateway_transaction_id: String,
    pub created_at: DateTime<Utc>,
}

/// Settlement fields known before issuance; the entitlement id is filled in by the
/// ledger inside the same write.
#[derive(Debug, Clone)]
pub struct NewSettlement {
    pub order_id: String,
    pub buyer_id: Uuid,
    pub academy_id: Uuid,
    pub product_id: Uuid,
    pub amount: i64,
    pub gateway_transaction_id: String,
}

impl NewSettlement {
    pub fn for_order(order: &PurchaseOrder, gateway_transaction_id: &str) -> Self {
        Self {
            order_id: order.order_id.clone(),
            buyer_id: order.buyer_id,
            academy_id: order.academy_id,
            product_id: order.product_id,
            amount: order.amount,
            gateway_transaction_id: gateway_transaction_id.to_string(),
        }
    }
}

/// Entitlement and settlement written together for one order.
#[derive(Debug, Clone)]
pub struct Issuance {
    pub entitlement: Entitlement,
    pub settlement: Settlement,
}

pub const BOOKING_CONFIRMED: &str = "CONFIRMED";

#[derive(Debug, Clone, FromRow, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub entitlement_id: Uuid,
    pub session_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
}
