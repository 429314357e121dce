use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::models::{
    BillingPlan, Booking, Entitlement, Issuance, NewEntitlement, NewPaymentAttempt,
    NewPurchaseOrder, NewSettlement, PaymentAttempt, PaymentStatus, PurchaseOrder, Settlement,
    Subscription, SubscriptionStatus, SubscriptionTransition, TicketProduct, BOOKING_CONFIRMED,
    ENTITLEMENT_ACTIVE,
};
use super::store::{InsertOutcome, LedgerStore, SessionBookings};

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, academy_id, plan_id, billing_cycle, status, current_period_start,
    current_period_end, trial_ends_at, grace_period_end, cancel_at_period_end,
    discount_percent, first_period_free, billing_credential, customer_ref,
    canceled_at, created_at, updated_at
"#;

const PAYMENT_COLUMNS: &str = r#"
    id, subscription_id, academy_id, amount, billing_cycle, period_start, period_end,
    gateway_transaction_id, gateway_order_id, status, failure_code, failure_message,
    retry_count, next_retry_at, paid_at, created_at
"#;

const ORDER_COLUMNS: &str = r#"
    id, order_id, buyer_id, academy_id, product_id, amount, status, session_id, uses,
    valid_days, gateway_transaction_id, created_at, updated_at
"#;

const SETTLEMENT_COLUMNS: &str = r#"
    id, order_id, buyer_id, academy_id, product_id, entitlement_id, amount,
    gateway_transaction_id, created_at
"#;

/// key: ledger-store-postgres -> sqlx implementation
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn select_subscriptions(&self, predicate: &str, today: NaiveDate) -> Result<Vec<Subscription>> {
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM academy_subscriptions WHERE {predicate} ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&query)
            .bind(today)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    academy_id: Uuid,
    plan_id: String,
    billing_cycle: String,
    status: String,
    current_period_start: Option<NaiveDate>,
    current_period_end: Option<NaiveDate>,
    trial_ends_at: Option<NaiveDate>,
    grace_period_end: Option<NaiveDate>,
    cancel_at_period_end: bool,
    discount_percent: Option<i32>,
    first_period_free: bool,
    billing_credential: Option<String>,
    customer_ref: Option<String>,
    canceled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = anyhow::Error;

    fn try_from(row: SubscriptionRow) -> Result<Self> {
        Ok(Subscription {
            id: row.id,
            academy_id: row.academy_id,
            plan_id: row.plan_id,
            billing_cycle: row.billing_cycle.parse()?,
            status: row.status.parse()?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            trial_ends_at: row.trial_ends_at,
            grace_period_end: row.grace_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            discount_percent: row.discount_percent,
            first_period_free: row.first_period_free,
            billing_credential: row.billing_credential,
            customer_ref: row.customer_ref,
            canceled_at: row.canceled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    subscription_id: Uuid,
    academy_id: Uuid,
    amount: i64,
    billing_cycle: String,
    period_start: Option<NaiveDate>,
    period_end: Option<NaiveDate>,
    gateway_transaction_id: Option<String>,
    gateway_order_id: String,
    status: String,
    failure_code: Option<String>,
    failure_message: Option<String>,
    retry_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for PaymentAttempt {
    type Error = anyhow::Error;

    fn try_from(row: PaymentRow) -> Result<Self> {
        Ok(PaymentAttempt {
            id: row.id,
            subscription_id: row.subscription_id,
            academy_id: row.academy_id,
            amount: row.amount,
            billing_cycle: row.billing_cycle.parse()?,
            period_start: row.period_start,
            period_end: row.period_end,
            gateway_transaction_id: row.gateway_transaction_id,
            gateway_order_id: row.gateway_order_id,
            status: row.status.parse()?,
            failure_code: row.failure_code,
            failure_message: row.failure_message,
            retry_count: row.retry_count,
            next_retry_at: row.next_retry_at,
            paid_at: row.paid_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct OrderRow {
    id: Uuid,
    order_id: String,
    buyer_id: Uuid,
    academy_id: Uuid,
    product_id: Uuid,
    amount: i64,
    status: String,
    session_id: Option<Uuid>,
    uses: Option<i32>,
    valid_days: Option<i32>,
    gateway_transaction_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for PurchaseOrder {
    type Error = anyhow::Error;

    fn try_from(row: OrderRow) -> Result<Self> {
        Ok(PurchaseOrder {
            id: row.id,
            order_id: row.order_id,
            buyer_id: row.buyer_id,
            academy_id: row.academy_id,
            product_id: row.product_id,
            amount: row.amount,
            status: row.status.parse()?,
            session_id: row.session_id,
            uses: row.uses,
            valid_days: row.valid_days,
            gateway_transaction_id: row.gateway_transaction_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505")
            && db_err.constraint().map_or(true, |name| name == constraint);
    }
    false
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn plan(&self, plan_id: &str) -> Result<Option<BillingPlan>> {
        let plan = sqlx::query_as::<_, BillingPlan>(
            "SELECT id, display_name, monthly_price, annual_price_per_month FROM billing_plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>> {
        let query = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM academy_subscriptions WHERE id = $1");
        let row = sqlx::query_as::<_, SubscriptionRow>(&query)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn due_subscriptions(&self, today: NaiveDate) -> Result<Vec<Subscription>> {
        self.select_subscriptions(
            "status = 'active' AND current_period_end <= $1 AND billing_credential IS NOT NULL",
            today,
        )
        .await
    }

    async fn due_trials(&self, today: NaiveDate) -> Result<Vec<Subscription>> {
        self.select_subscriptions(
            "status = 'trial' AND trial_ends_at <= $1 AND billing_credential IS NOT NULL",
            today,
        )
        .await
    }

    async fn lapsed_grace_subscriptions(&self, today: NaiveDate) -> Result<Vec<Subscription>> {
        self.select_subscriptions("status = 'past_due' AND grace_period_end < $1", today)
            .await
    }

    async fn transition_subscription(
        &self,
        subscription_id: Uuid,
        expected: SubscriptionStatus,
        transition: SubscriptionTransition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = match transition {
            SubscriptionTransition::Renew {
                period_start,
                period_end,
            } => {
                sqlx::query(
                    r#"
                    UPDATE academy_subscriptions
                    SET status = 'active',
                        current_period_start = $3,
                        current_period_end = $4,
                        grace_period_end = NULL,
                        billing_claimed_until = NULL,
                        updated_at = $5
                    WHERE id = $1 AND status = $2
                    "#,
                )
                .bind(subscription_id)
                .bind(expected.as_str())
                .bind(period_start)
                .bind(period_end)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            SubscriptionTransition::Cancel => {
                sqlx::query(
                    r#"
                    UPDATE academy_subscriptions
                    SET status = 'canceled', canceled_at = $3, billing_claimed_until = NULL,
                        updated_at = $3
                    WHERE id = $1 AND status = $2
                    "#,
                )
                .bind(subscription_id)
                .bind(expected.as_str())
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            SubscriptionTransition::PastDue { grace_period_end } => {
                sqlx::query(
                    r#"
                    UPDATE academy_subscriptions
                    SET status = 'past_due', grace_period_end = $3, billing_claimed_until = NULL,
                        updated_at = $4
                    WHERE id = $1 AND status = $2
                    "#,
                )
                .bind(subscription_id)
                .bind(expected.as_str())
                .bind(grace_period_end)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            SubscriptionTransition::Expire => {
                sqlx::query(
                    r#"
                    UPDATE academy_subscriptions
                    SET status = 'expired', billing_claimed_until = NULL, updated_at = $3
                    WHERE id = $1 AND status = $2
                    "#,
                )
                .bind(subscription_id)
                .bind(expected.as_str())
                .bind(now)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn claim_subscription(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE academy_subscriptions
            SET billing_claimed_until = $4
            WHERE id = $1
              AND status = $2
              AND current_period_end IS NOT DISTINCT FROM $3
              AND (billing_claimed_until IS NULL OR billing_claimed_until <= $5)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_end)
        .bind(lease_until)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn request_cancellation(&self, subscription_id: Uuid) -> Result<Option<Subscription>> {
        let query = format!(
            r#"
            UPDATE academy_subscriptions
            SET cancel_at_period_end = TRUE, updated_at = NOW()
            WHERE id = $1 AND status IN ('trial', 'active', 'past_due')
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&query)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn revoke_billing_credential(
        &self,
        customer_ref: &str,
        grace_period_end: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE academy_subscriptions
            SET billing_credential = NULL,
                status = CASE WHEN status IN ('trial', 'active') THEN 'past_due' ELSE status END,
                grace_period_end = CASE
                    WHEN status IN ('trial', 'active') THEN $2
                    ELSE grace_period_end
                END,
                updated_at = $3
            WHERE customer_ref = $1
            "#,
        )
        .bind(customer_ref)
        .bind(grace_period_end)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn completed_attempt_count(&self, subscription_id: Uuid) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM subscription_payments WHERE subscription_id = $1 AND status = 'completed'",
        )
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn record_attempt(&self, attempt: NewPaymentAttempt) -> Result<PaymentAttempt> {
        let query = format!(
            r#"
            INSERT INTO subscription_payments (
                id, subscription_id, academy_id, amount, billing_cycle, period_start,
                period_end, gateway_transaction_id, gateway_order_id, status, failure_code,
                failure_message, retry_count, next_retry_at, paid_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 0, $13, $14)
            RETURNING {PAYMENT_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(Uuid::new_v4())
            .bind(attempt.subscription_id)
            .bind(attempt.academy_id)
            .bind(attempt.amount)
            .bind(attempt.billing_cycle.as_str())
            .bind(attempt.period.map(|(start, _)| start))
            .bind(attempt.period.map(|(_, end)| end))
            .bind(attempt.gateway_transaction_id)
            .bind(&attempt.gateway_order_id)
            .bind(attempt.status.as_str())
            .bind(attempt.failure_code)
            .bind(attempt.failure_message)
            .bind(attempt.next_retry_at)
            .bind(attempt.paid_at)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("recording payment attempt {}", attempt.gateway_order_id))?;
        PaymentAttempt::try_from(row)
    }

    async fn retryable_attempts(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
    ) -> Result<Vec<PaymentAttempt>> {
        let query = format!(
            r#"
            SELECT {PAYMENT_COLUMNS}
            FROM subscription_payments
            WHERE status = 'failed'
              AND next_retry_at <= $1
              AND retry_count < $2
            ORDER BY created_at DESC
            "#
        );
        let rows = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(now)
            .bind(max_retries)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(PaymentAttempt::try_from).collect()
    }

    async fn claim_retry(
        &self,
        attempt_id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscription_payments
            SET next_retry_at = $3
            WHERE id = $1 AND status = 'failed' AND next_retry_at <= $2
            "#,
        )
        .bind(attempt_id)
        .bind(now)
        .bind(lease_until)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_retry_failure(
        &self,
        attempt_id: Uuid,
        max_retries: i32,
        next_retry_at: DateTime<Utc>,
        failure_code: &str,
        failure_message: &str,
    ) -> Result<Option<i32>> {
        let count: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE subscription_payments
            SET retry_count = retry_count + 1,
                next_retry_at = $3,
                failure_code = $4,
                failure_message = $5
            WHERE id = $1 AND status = 'failed' AND retry_count < $2
            RETURNING retry_count
            "#,
        )
        .bind(attempt_id)
        .bind(max_retries)
        .bind(next_retry_at)
        .bind(failure_code)
        .bind(failure_message)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count)
    }

    async fn clear_retry_schedule(&self, subscription_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscription_payments
            SET next_retry_at = NULL
            WHERE subscription_id = $1 AND status = 'failed' AND next_retry_at IS NOT NULL
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn attempt(&self, attempt_id: Uuid) -> Result<Option<PaymentAttempt>> {
        let query = format!("SELECT {PAYMENT_COLUMNS} FROM subscription_payments WHERE id = $1");
        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(attempt_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PaymentAttempt::try_from).transpose()
    }

    async fn attempt_by_gateway_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<PaymentAttempt>> {
        let query =
            format!("SELECT {PAYMENT_COLUMNS} FROM subscription_payments WHERE gateway_order_id = $1");
        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(gateway_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PaymentAttempt::try_from).transpose()
    }

    async fn set_attempt_status(
        &self,
        attempt_id: Uuid,
        status: PaymentStatus,
        gateway_transaction_id: Option<&str>,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE subscription_payments
            SET status = $2,
                gateway_transaction_id = COALESCE($3, gateway_transaction_id),
                paid_at = $4,
                next_retry_at = CASE WHEN $2 = 'failed' THEN next_retry_at ELSE NULL END
            WHERE id = $1
            "#,
        )
        .bind(attempt_id)
        .bind(status.as_str())
        .bind(gateway_transaction_id)
        .bind(paid_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn product(&self, product_id: Uuid) -> Result<Option<TicketProduct>> {
        let product = sqlx::query_as::<_, TicketProduct>(
            r#"
            SELECT id, academy_id, name, price, uses, valid_days, is_on_sale, is_public
            FROM ticket_products
            WHERE id = $1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(product)
    }

    async fn create_order(
        &self,
        order: NewPurchaseOrder,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome<PurchaseOrder>> {
        let query = format!(
            r#"
            INSERT INTO purchase_orders (
                id, order_id, buyer_id, academy_id, product_id, amount, status, session_id,
                uses, valid_days, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', $7, $8, $9, $10, $10)
            RETURNING {ORDER_COLUMNS}
            "#
        );
        let result = sqlx::query_as::<_, OrderRow>(&query)
            .bind(Uuid::new_v4())
            .bind(&order.order_id)
            .bind(order.buyer_id)
            .bind(order.academy_id)
            .bind(order.product_id)
            .bind(order.amount)
            .bind(order.session_id)
            .bind(order.uses)
            .bind(order.valid_days)
            .bind(now)
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(row) => Ok(InsertOutcome::Inserted(PurchaseOrder::try_from(row)?)),
            Err(err) if is_unique_violation(&err, "purchase_orders_order_id_key") => {
                Ok(InsertOutcome::Conflict)
            }
            Err(err) => Err(err)
                .with_context(|| format!("creating purchase order {}", order.order_id)),
        }
    }

    async fn order_for_buyer(
        &self,
        order_id: &str,
        buyer_id: Uuid,
    ) -> Result<Option<PurchaseOrder>> {
        let query = format!(
            "SELECT {ORDER_COLUMNS} FROM purchase_orders WHERE order_id = $1 AND buyer_id = $2"
        );
        let row = sqlx::query_as::<_, OrderRow>(&query)
            .bind(order_id)
            .bind(buyer_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PurchaseOrder::try_from).transpose()
    }

    async fn mark_order_failed(&self, order_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE purchase_orders SET status = 'FAILED', updated_at = $2 WHERE order_id = $1 AND status = 'PENDING'",
        )
        .bind(order_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_order_completed(
        &self,
        order_id: &str,
        gateway_transaction_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE purchase_orders
            SET status = 'COMPLETED', gateway_transaction_id = $2, updated_at = $3
            WHERE order_id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(order_id)
        .bind(gateway_transaction_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn entitlement(&self, entitlement_id: Uuid) -> Result<Option<Entitlement>> {
        let row = sqlx::query_as::<_, Entitlement>("SELECT * FROM entitlements WHERE id = $1")
            .bind(entitlement_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn settlement_for_order(&self, order_id: &str) -> Result<Option<Settlement>> {
        let query = format!("SELECT {SETTLEMENT_COLUMNS} FROM settlements WHERE order_id = $1");
        let row = sqlx::query_as::<_, Settlement>(&query)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn settle_order(
        &self,
        entitlement: NewEntitlement,
        settlement: NewSettlement,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome<Issuance>> {
        let mut tx = self.pool.begin().await?;
        let entitlement = sqlx::query_as::<_, Entitlement>(
            r#"
            INSERT INTO entitlements (
                id, buyer_id, academy_id, product_id, order_id, remaining_uses,
                start_date, expiry_date, status, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entitlement.buyer_id)
        .bind(entitlement.academy_id)
        .bind(entitlement.product_id)
        .bind(&entitlement.order_id)
        .bind(entitlement.remaining_uses)
        .bind(entitlement.start_date)
        .bind(entitlement.expiry_date)
        .bind(ENTITLEMENT_ACTIVE)
        .bind(now)
        .fetch_one(&mut tx)
        .await?;

        // Blocks on a concurrent uncommitted settlement for the same order, then yields
        // nothing once that one commits.
        let query = format!(
            r#"
            INSERT INTO settlements (
                id, order_id, buyer_id, academy_id, product_id, entitlement_id, amount,
                gateway_transaction_id, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT ON CONSTRAINT settlements_order_id_key DO NOTHING
            RETURNING {SETTLEMENT_COLUMNS}
            "#
        );
        let settlement = sqlx::query_as::<_, Settlement>(&query)
            .bind(Uuid::new_v4())
            .bind(&settlement.order_id)
            .bind(settlement.buyer_id)
            .bind(settlement.academy_id)
            .bind(settlement.product_id)
            .bind(entitlement.id)
            .bind(settlement.amount)
            .bind(&settlement.gateway_transaction_id)
            .bind(now)
            .fetch_optional(&mut tx)
            .await?;

        match settlement {
            Some(settlement) => {
                tx.commit().await?;
                Ok(InsertOutcome::Inserted(Issuance {
                    entitlement,
                    settlement,
                }))
            }
            None => {
                tx.rollback().await?;
                Ok(InsertOutcome::Conflict)
            }
        }
    }

    async fn webhook_event_seen(&self, event_id: &str) -> Result<bool> {
        let seen: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM payment_webhook_events WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(seen)
    }

    async fn record_webhook_event(
        &self,
        event_id: &str,
        event_type: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO payment_webhook_events (id, event_id, event_type, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl SessionBookings for PgLedgerStore {
    async fn find(&self, entitlement_id: Uuid, session_id: Uuid) -> Result<Option<Booking>> {
        let row = sqlx::query_as::<_, Booking>(
            "SELECT * FROM bookings WHERE entitlement_id = $1 AND session_id = $2",
        )
        .bind(entitlement_id)
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn reserve(
        &self,
        buyer_id: Uuid,
        entitlement_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Booking>> {
        if let Some(existing) = self.find(entitlement_id, session_id).await? {
            return Ok(Some(existing));
        }

        let mut tx = self.pool.begin().await?;
        let consumed = sqlx::query(
            r#"
            UPDATE entitlements
            SET remaining_uses = remaining_uses - 1
            WHERE id = $1 AND (remaining_uses IS NULL OR remaining_uses > 0)
            "#,
        )
        .bind(entitlement_id)
        .execute(&mut tx)
        .await?;
        if consumed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let booking = sqlx::query_as::<_, Booking>(
            r#"
            INSERT INTO bookings (id, buyer_id, entitlement_id, session_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (entitlement_id, session_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(buyer_id)
        .bind(entitlement_id)
        .bind(session_id)
        .bind(BOOKING_CONFIRMED)
        .bind(now)
        .fetch_optional(&mut tx)
        .await?;

        match booking {
            Some(booking) => {
                tx.commit().await?;
                Ok(Some(booking))
            }
            None => {
                // A concurrent reservation won; give the use back.
                tx.rollback().await?;
                self.find(entitlement_id, session_id).await
            }
        }
    }
}
