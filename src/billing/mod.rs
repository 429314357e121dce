pub mod amount;
pub mod api;
pub mod confirmation;
pub mod gateway;
pub mod memory;
pub mod models;
pub mod notifications;
pub mod orders;
pub mod postgres;
pub mod refunds;
pub mod scheduler;
pub mod store;

pub use amount::calculate_amount;
pub use api::{
    cancel_subscription, confirm_purchase, create_order, refund_payment, run_cron, BillingContext,
};
pub use confirmation::{
    ConfirmPurchase, ConfirmationError, ConfirmationOutcome, PurchaseConfirmationService,
};
pub use gateway::{
    new_order_id, ChargeReceipt, GatewayAdapter, GatewayError, HttpGatewayAdapter, StoredCharge,
};
pub use memory::MemoryLedgerStore;
pub use models::{
    BillingCycle, BillingPlan, Booking, Entitlement, Issuance, OrderStatus, PaymentAttempt,
    PaymentStatus, PurchaseOrder, Settlement, Subscription, SubscriptionStatus,
    SubscriptionTransition, TicketProduct,
};
pub use notifications::{
    start_notification_worker, LogNotifier, Notification, NotificationHandle, Notifier,
};
pub use orders::{create_purchase_order, CreatePurchaseOrder, CreatedOrder, OrderError};
pub use postgres::PgLedgerStore;
pub use refunds::{refund_subscription_payment, RefundError, RefundOutcome, RefundPayment};
pub use scheduler::{
    run_billing_tick, spawn as spawn_billing_scheduler, BillingPolicy, BillingSweeper,
    SweepReport, CLAIM_LEASE_MINUTES,
};
pub use store::{InsertOutcome, LedgerStore, SessionBookings};
