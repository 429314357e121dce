use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config;

use super::amount::calculate_amount;
use super::gateway::{new_order_id, GatewayAdapter, GatewayError, StoredCharge};
use super::models::{
    NewPaymentAttempt, PaymentAttempt, Subscription, SubscriptionStatus, SubscriptionTransition,
};
use super::store::LedgerStore;

/// How long a sweep holds a work item while charging it. Outlives the gateway timeout so
/// a lease never lapses mid-call; a sweep that dies mid-charge frees the item after it.
pub const CLAIM_LEASE_MINUTES: i64 = 15;

/// key: billing-policy -> knobs the sweeps run with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPolicy {
    pub grace_period_days: i64,
    pub retry_interval_days: i64,
    pub max_retries: i32,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            grace_period_days: 7,
            retry_interval_days: 3,
            max_retries: 3,
        }
    }
}

impl BillingPolicy {
    pub fn from_env() -> Self {
        Self {
            grace_period_days: *config::BILLING_GRACE_PERIOD_DAYS,
            retry_interval_days: *config::BILLING_RETRY_INTERVAL_DAYS,
            max_retries: *config::BILLING_MAX_RETRIES,
        }
    }

    pub fn grace_end(&self, today: NaiveDate) -> NaiveDate {
        today + Duration::days(self.grace_period_days)
    }

    pub fn next_retry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::days(self.retry_interval_days)
    }

    pub fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::minutes(CLAIM_LEASE_MINUTES)
    }
}

/// key: billing-sweep-report -> summary returned to the cron trigger
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub charged: u32,
    pub failed: u32,
    pub trial_expired: u32,
    pub expired: u32,
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn merge(&mut self, other: SweepReport) {
        self.charged += other.charged;
        self.failed += other.failed;
        self.trial_expired += other.trial_expired;
        self.expired += other.expired;
        self.errors.extend(other.errors);
    }

    fn record_error(&mut self, subject: impl std::fmt::Display, err: &anyhow::Error) {
        self.errors.push(format!("{subject}: {err:#}"));
    }
}

/// Outcome of one charge against a stored credential, before any state is written.
enum ChargeResult {
    Paid { transaction_id: Option<String> },
    Failed(GatewayError),
}

/// key: billing-sweeps -> recurring, trial, retry and grace sweeps over the ledger
///
/// Every sweep isolates items: one subscription failing never stops the rest, its error
/// lands in the report instead.
pub struct BillingSweeper<'a> {
    store: &'a dyn LedgerStore,
    gateway: &'a dyn GatewayAdapter,
    clock: &'a dyn Clock,
    policy: BillingPolicy,
}

impl<'a> BillingSweeper<'a> {
    pub fn new(
        store: &'a dyn LedgerStore,
        gateway: &'a dyn GatewayAdapter,
        clock: &'a dyn Clock,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            policy,
        }
    }

    /// key: recurring-charge-scheduler -> charge active subscriptions whose period ended
    pub async fn run_recurring_charges(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let today = self.clock.today();
        let due = match self.store.due_subscriptions(today).await {
            Ok(due) => due,
            Err(err) => {
                warn!(?err, "failed to select subscriptions due for renewal");
                report.record_error("recurring selection", &err);
                return report;
            }
        };

        for subscription in due {
            if let Err(err) = self.renew(&subscription, &mut report).await {
                warn!(?err, subscription = %subscription.id, "recurring charge failed");
                report.record_error(subscription.id, &err);
            }
        }
        report
    }

    /// key: trial-conversion-handler -> first real charge for trials past their end
    pub async fn run_trial_conversions(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let today = self.clock.today();
        let due = match self.store.due_trials(today).await {
            Ok(due) => due,
            Err(err) => {
                warn!(?err, "failed to select trials due for conversion");
                report.record_error("trial selection", &err);
                return report;
            }
        };

        for subscription in due {
            if let Err(err) = self.convert_trial(&subscription, &mut report).await {
                warn!(?err, subscription = %subscription.id, "trial conversion failed");
                report.record_error(subscription.id, &err);
            }
        }
        report
    }

    /// key: retry-coordinator -> re-attempt failed charges under the retry ceiling
    pub async fn run_payment_retries(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = self.clock.now();
        let attempts = match self
            .store
            .retryable_attempts(now, self.policy.max_retries)
            .await
        {
            Ok(attempts) => attempts,
            Err(err) => {
                warn!(?err, "failed to select payment attempts due for retry");
                report.record_error("retry selection", &err);
                return report;
            }
        };

        // Newest first, so the first attempt seen per subscription is its latest failure.
        let mut seen = HashSet::new();
        for attempt in attempts {
            if !seen.insert(attempt.subscription_id) {
                debug!(
                    attempt = %attempt.id,
                    subscription = %attempt.subscription_id,
                    "older failure skipped; subscription already retried this sweep"
                );
                continue;
            }
            if let Err(err) = self.retry(&attempt, &mut report).await {
                warn!(
                    ?err,
                    attempt = %attempt.id,
                    subscription = %attempt.subscription_id,
                    "payment retry failed"
                );
                report.record_error(attempt.subscription_id, &err);
            }
        }
        report
    }

    /// key: grace-expiry-sweep -> past_due subscriptions whose grace window lapsed
    pub async fn expire_lapsed_grace(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let today = self.clock.today();
        let lapsed = match self.store.lapsed_grace_subscriptions(today).await {
            Ok(lapsed) => lapsed,
            Err(err) => {
                warn!(?err, "failed to select subscriptions with lapsed grace");
                report.record_error("grace selection", &err);
                return report;
            }
        };

        for subscription in lapsed {
            let result = async {
                let expired = self
                    .store
                    .transition_subscription(
                        subscription.id,
                        SubscriptionStatus::PastDue,
                        SubscriptionTransition::Expire,
                        self.clock.now(),
                    )
                    .await?;
                if expired {
                    self.store.clear_retry_schedule(subscription.id).await?;
                }
                Ok::<_, anyhow::Error>(expired)
            }
            .await;

            match result {
                Ok(true) => {
                    info!(subscription = %subscription.id, "subscription expired after grace period");
                    report.expired += 1;
                }
                Ok(false) => debug!(
                    subscription = %subscription.id,
                    "subscription left past_due before expiry"
                ),
                Err(err) => {
                    warn!(?err, subscription = %subscription.id, "failed to expire subscription");
                    report.record_error(subscription.id, &err);
                }
            }
        }
        report
    }

    /// key: billing-tick -> one idempotent pass of every sweep
    pub async fn run_tick(&self) -> SweepReport {
        let mut report = self.run_recurring_charges().await;
        report.merge(self.run_trial_conversions().await);
        report.merge(self.run_payment_retries().await);
        report.merge(self.expire_lapsed_grace().await);
        info!(
            charged = report.charged,
            failed = report.failed,
            trial_expired = report.trial_expired,
            expired = report.expired,
            errors = report.errors.len(),
            "billing tick finished"
        );
        report
    }

    async fn payable_amount(&self, subscription: &Subscription) -> Result<i64> {
        let plan = self
            .store
            .plan(&subscription.plan_id)
            .await?
            .ok_or_else(|| anyhow!("billing plan `{}` not found", subscription.plan_id))?;
        let completed = self.store.completed_attempt_count(subscription.id).await?;
        Ok(calculate_amount(
            plan.base_amount(subscription.billing_cycle),
            subscription.discount_percent,
            subscription.first_period_free,
            completed,
        ))
    }

    /// Zero amounts never reach the gateway. A missing credential is an error, never a
    /// free charge.
    async fn charge(
        &self,
        subscription: &Subscription,
        amount: i64,
        order_id: &str,
    ) -> Result<ChargeResult> {
        if amount == 0 {
            return Ok(ChargeResult::Paid {
                transaction_id: None,
            });
        }
        let credential = subscription
            .billing_credential
            .as_deref()
            .ok_or_else(|| anyhow!("billing credential missing"))?;
        let description = format!("{} subscription", subscription.plan_id);
        let charge = StoredCharge {
            credential,
            customer_ref: subscription.customer_ref.as_deref(),
            amount,
            order_id,
            description: &description,
        };

        match self.gateway.charge_stored(&charge).await {
            Ok(receipt) => Ok(ChargeResult::Paid {
                transaction_id: Some(receipt.transaction_id),
            }),
            Err(GatewayError::ConfigMissing(detail)) => {
                Err(anyhow!("payment gateway not configured: {detail}"))
            }
            Err(err) => Ok(ChargeResult::Failed(err)),
        }
    }

    fn renewal_transition(
        &self,
        subscription: &Subscription,
    ) -> (SubscriptionTransition, (NaiveDate, NaiveDate)) {
        let period = subscription.billing_cycle.period_from(self.clock.today());
        let transition = if subscription.cancel_at_period_end {
            SubscriptionTransition::Cancel
        } else {
            SubscriptionTransition::Renew {
                period_start: period.0,
                period_end: period.1,
            }
        };
        (transition, period)
    }

    /// Applies a paid charge: moves the subscription forward (or cancels it) and records
    /// the completed attempt.
    async fn settle_paid(
        &self,
        subscription: &Subscription,
        expected: SubscriptionStatus,
        amount: i64,
        order_id: String,
        transaction_id: Option<String>,
    ) -> Result<()> {
        let now = self.clock.now();
        let (transition, period) = self.renewal_transition(subscription);
        let target = transition.target_status();
        let applied = self
            .store
            .transition_subscription(subscription.id, expected, transition, now)
            .await?;
        if !applied {
            warn!(
                subscription = %subscription.id,
                %order_id,
                "subscription changed while charging; recording payment only"
            );
        }
        self.store
            .record_attempt(NewPaymentAttempt::completed(
                subscription,
                amount,
                period,
                order_id,
                transaction_id,
                now,
            ))
            .await?;
        info!(
            subscription = %subscription.id,
            amount,
            status = %target,
            "subscription charge completed"
        );
        Ok(())
    }

    /// Applies a failed charge: past_due with grace, plus a retryable failed attempt.
    async fn settle_failed(
        &self,
        subscription: &Subscription,
        expected: SubscriptionStatus,
        amount: i64,
        order_id: String,
        err: &GatewayError,
    ) -> Result<()> {
        let now = self.clock.now();
        let grace_period_end = self.policy.grace_end(self.clock.today());
        let applied = self
            .store
            .transition_subscription(
                subscription.id,
                expected,
                SubscriptionTransition::PastDue { grace_period_end },
                now,
            )
            .await?;
        if !applied {
            warn!(
                subscription = %subscription.id,
                %order_id,
                "subscription changed while charging; recording failure only"
            );
        }
        self.store
            .record_attempt(NewPaymentAttempt::failed(
                subscription,
                amount,
                order_id,
                err.code().to_string(),
                err.message(),
                self.policy.next_retry(now),
            ))
            .await?;
        warn!(
            subscription = %subscription.id,
            amount,
            code = err.code(),
            message = %err.message(),
            %grace_period_end,
            "subscription charge failed; moved to past_due"
        );
        Ok(())
    }

    /// `false` when another sweep holds the subscription or it moved since it was listed.
    async fn claim(&self, subscription: &Subscription) -> Result<bool> {
        let now = self.clock.now();
        let claimed = self
            .store
            .claim_subscription(subscription, now, self.policy.lease_until(now))
            .await?;
        if !claimed {
            debug!(
                subscription = %subscription.id,
                status = %subscription.status,
                "subscription claimed by another sweep; skipping"
            );
        }
        Ok(claimed)
    }

    async fn renew(&self, subscription: &Subscription, report: &mut SweepReport) -> Result<()> {
        let amount = self.payable_amount(subscription).await?;
        if !self.claim(subscription).await? {
            return Ok(());
        }
        let order_id = new_order_id("auto", subscription.academy_id);
        match self.charge(subscription, amount, &order_id).await? {
            ChargeResult::Paid { transaction_id } => {
                self.settle_paid(
                    subscription,
                    SubscriptionStatus::Active,
                    amount,
                    order_id,
                    transaction_id,
                )
                .await?;
                report.charged += 1;
            }
            ChargeResult::Failed(err) => {
                self.settle_failed(subscription, SubscriptionStatus::Active, amount, order_id, &err)
                    .await?;
                report.failed += 1;
            }
        }
        Ok(())
    }

    async fn convert_trial(
        &self,
        subscription: &Subscription,
        report: &mut SweepReport,
    ) -> Result<()> {
        let now = self.clock.now();
        if self.store.completed_attempt_count(subscription.id).await? > 0 {
            if self
                .store
                .transition_subscription(
                    subscription.id,
                    SubscriptionStatus::Trial,
                    SubscriptionTransition::Expire,
                    now,
                )
                .await?
            {
                warn!(
                    subscription = %subscription.id,
                    "trial already has a completed payment; expired without charging"
                );
                report.trial_expired += 1;
            }
            return Ok(());
        }

        let amount = self.payable_amount(subscription).await?;
        if !self.claim(subscription).await? {
            return Ok(());
        }
        let order_id = new_order_id("trial", subscription.academy_id);
        match self.charge(subscription, amount, &order_id).await? {
            ChargeResult::Paid { transaction_id } => {
                self.settle_paid(
                    subscription,
                    SubscriptionStatus::Trial,
                    amount,
                    order_id,
                    transaction_id,
                )
                .await?;
                report.charged += 1;
            }
            ChargeResult::Failed(err @ GatewayError::Declined { .. }) => {
                self.settle_failed(subscription, SubscriptionStatus::Trial, amount, order_id, &err)
                    .await?;
                report.failed += 1;
            }
            ChargeResult::Failed(err) => {
                // No period was ever paid, so no grace is owed.
                let expired = self
                    .store
                    .transition_subscription(
                        subscription.id,
                        SubscriptionStatus::Trial,
                        SubscriptionTransition::Expire,
                        now,
                    )
                    .await?;
                warn!(
                    subscription = %subscription.id,
                    code = err.code(),
                    message = %err.message(),
                    expired,
                    "trial conversion could not reach the gateway"
                );
                if expired {
                    report.trial_expired += 1;
                }
                report
                    .errors
                    .push(format!("{}: trial conversion failed: {err}", subscription.id));
            }
        }
        Ok(())
    }

    async fn retry(&self, attempt: &PaymentAttempt, report: &mut SweepReport) -> Result<()> {
        let subscription = self
            .store
            .subscription(attempt.subscription_id)
            .await?
            .ok_or_else(|| anyhow!("subscription {} not found", attempt.subscription_id))?;

        if subscription.status != SubscriptionStatus::PastDue {
            let cleared = self.store.clear_retry_schedule(subscription.id).await?;
            debug!(
                subscription = %subscription.id,
                status = %subscription.status,
                cleared,
                "subscription no longer past_due; retry schedule cleared"
            );
            return Ok(());
        }

        let now = self.clock.now();
        if !self
            .store
            .claim_retry(attempt.id, now, self.policy.lease_until(now))
            .await?
        {
            debug!(
                attempt = %attempt.id,
                subscription = %subscription.id,
                "retry claimed by another sweep; skipping"
            );
            return Ok(());
        }

        let order_id = new_order_id("retry", subscription.academy_id);
        match self.charge(&subscription, attempt.amount, &order_id).await? {
            ChargeResult::Paid { transaction_id } => {
                self.settle_paid(
                    &subscription,
                    SubscriptionStatus::PastDue,
                    attempt.amount,
                    order_id,
                    transaction_id,
                )
                .await?;
                self.store.clear_retry_schedule(subscription.id).await?;
                report.charged += 1;
            }
            ChargeResult::Failed(err) => {
                let updated = self
                    .store
                    .record_retry_failure(
                        attempt.id,
                        self.policy.max_retries,
                        self.policy.next_retry(now),
                        err.code(),
                        &err.message(),
                    )
                    .await?;
                match updated {
                    Some(retry_count) => {
                        report.failed += 1;
                        if retry_count >= self.policy.max_retries {
                            warn!(
                                attempt = %attempt.id,
                                subscription = %subscription.id,
                                retry_count,
                                code = err.code(),
                                "retry ceiling reached; attempt is terminal"
                            );
                        } else {
                            info!(
                                attempt = %attempt.id,
                                subscription = %subscription.id,
                                retry_count,
                                code = err.code(),
                                "payment retry failed; rescheduled"
                            );
                        }
                    }
                    None => debug!(
                        attempt = %attempt.id,
                        "attempt reached its ceiling in a concurrent sweep"
                    ),
                }
            }
        }
        Ok(())
    }
}

/// key: billing-tick -> entry point for any driver (cron route, interval task, manual)
pub async fn run_billing_tick(
    store: &dyn LedgerStore,
    gateway: &dyn GatewayAdapter,
    clock: &dyn Clock,
    policy: BillingPolicy,
) -> SweepReport {
    BillingSweeper::new(store, gateway, clock, policy)
        .run_tick()
        .await
}

/// key: billing-scheduler -> in-process ticker
pub fn spawn(
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn GatewayAdapter>,
    clock: Arc<dyn Clock>,
    policy: BillingPolicy,
    interval_secs: u64,
) {
    let interval = TokioDuration::from_secs(interval_secs);
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let report =
                run_billing_tick(store.as_ref(), gateway.as_ref(), clock.as_ref(), policy).await;
            if !report.errors.is_empty() {
                warn!(errors = ?report.errors, "billing tick finished with errors");
            }
        }
    });
}
