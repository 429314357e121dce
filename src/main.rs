use std::net::SocketAddr;
use std::sync::Arc;

use academy_billing::billing::{
    spawn_billing_scheduler, start_notification_worker, BillingContext, BillingPolicy,
    GatewayAdapter, HttpGatewayAdapter, LedgerStore, LogNotifier, PgLedgerStore,
};
use academy_billing::clock::{Clock, SystemClock};
use academy_billing::config;
use academy_billing::routes::api_routes;
use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

async fn root() -> &'static str {
    "Academy Billing API"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let _ = config::JWT_SECRET.as_str();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    if config::PAYMENT_GATEWAY_SECRET_KEY.is_none() {
        tracing::warn!("PAYMENT_GATEWAY_SECRET_KEY is not set; gateway calls will be skipped");
    }
    if config::CRON_SECRET.is_none() {
        tracing::warn!("CRON_SECRET is not set; the billing cron trigger is locked");
    }

    let ledger = Arc::new(PgLedgerStore::new(pool.clone()));
    let store: Arc<dyn LedgerStore> = ledger.clone();
    let gateway: Arc<dyn GatewayAdapter> = Arc::new(HttpGatewayAdapter::from_env()?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let policy = BillingPolicy::from_env();
    let notifications = start_notification_worker(Arc::new(LogNotifier));

    let billing = BillingContext::new(
        store.clone(),
        gateway.clone(),
        ledger,
        clock.clone(),
        policy,
    )
    .with_secrets(
        config::CRON_SECRET.clone(),
        config::PAYMENT_WEBHOOK_SECRET.clone(),
    )
    .with_notifications(notifications);

    if let Some(interval_secs) = *config::BILLING_SCHEDULER_INTERVAL_SECS {
        tracing::info!(interval_secs, "starting in-process billing scheduler");
        spawn_billing_scheduler(store, gateway, clock, policy, interval_secs);
    }

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(billing));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
