use axum::{
    routing::{get, post},
    Router,
};

use crate::{billing, webhooks};

pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/api/cron/billing",
            get(billing::run_cron).post(billing::run_cron),
        )
        .route("/api/purchases/orders", post(billing::create_order))
        .route("/api/purchases/confirm", post(billing::confirm_purchase))
        .route(
            "/api/billing/subscriptions/:id/cancel",
            post(billing::cancel_subscription),
        )
        .route(
            "/api/billing/subscriptions/:id/refund",
            post(billing::refund_payment),
        )
        .route("/api/billing/webhook", post(webhooks::payment_webhook))
}
