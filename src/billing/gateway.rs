use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// key: billing-gateway-errors -> closed set the state machines branch on
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("payment declined ({code}): {message}")]
    Declined { code: String, message: String },
    #[error("payment gateway unreachable: {0}")]
    Unreachable(String),
    #[error("payment gateway not configured: {0}")]
    ConfigMissing(String),
    #[error("unexpected payment gateway response: {0}")]
    Unknown(String),
}

impl GatewayError {
    pub fn code(&self) -> &str {
        match self {
            GatewayError::Declined { code, .. } => code,
            GatewayError::Unreachable(_) => "GATEWAY_UNREACHABLE",
            GatewayError::ConfigMissing(_) => "GATEWAY_NOT_CONFIGURED",
            GatewayError::Unknown(_) => "GATEWAY_UNKNOWN",
        }
    }

    pub fn message(&self) -> String {
        match self {
            GatewayError::Declined { message, .. } => message.clone(),
            GatewayError::Unreachable(detail)
            | GatewayError::ConfigMissing(detail)
            | GatewayError::Unknown(detail) => detail.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub transaction_id: String,
}

/// Charge against a stored billing credential.
#[derive(Debug, Clone)]
pub struct StoredCharge<'a> {
    pub credential: &'a str,
    pub customer_ref: Option<&'a str>,
    pub amount: i64,
    pub order_id: &'a str,
    pub description: &'a str,
}

/// key: billing-gateway -> provider integration
///
/// Every call must carry a freshly generated order id; the provider deduplicates on it.
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    async fn confirm(
        &self,
        transaction_ref: &str,
        order_id: &str,
        amount: i64,
    ) -> Result<ChargeReceipt, GatewayError>;

    async fn charge_stored(&self, charge: &StoredCharge<'_>) -> Result<ChargeReceipt, GatewayError>;

    /// Refunds a settled payment, in full when `amount` is `None`.
    async fn cancel(
        &self,
        transaction_id: &str,
        reason: &str,
        amount: Option<i64>,
    ) -> Result<ChargeReceipt, GatewayError>;
}

pub fn new_order_id(prefix: &str, academy_id: Uuid) -> String {
    let academy = academy_id.simple().to_string();
    format!("{prefix}_{}_{}", &academy[..8], Uuid::new_v4().simple())
}

/// key: billing-gateway-http -> REST adapter with basic-auth secret key
pub struct HttpGatewayAdapter {
    client: reqwest::Client,
    base_url: String,
    secret_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentResponse {
    payment_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderFailure {
    code: Option<String>,
    message: Option<String>,
}

impl HttpGatewayAdapter {
    pub fn new(
        base_url: impl Into<String>,
        secret_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build payment gateway client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            secret_key,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(
            crate::config::PAYMENT_GATEWAY_BASE_URL.as_str(),
            crate::config::PAYMENT_GATEWAY_SECRET_KEY.clone(),
            Duration::from_secs(*crate::config::PAYMENT_GATEWAY_TIMEOUT_SECS),
        )
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<ChargeReceipt, GatewayError> {
        let secret = self
            .secret_key
            .as_deref()
            .ok_or_else(|| GatewayError::ConfigMissing("secret key is not set".into()))?;

        let response = self
            .client
            .post(self.endpoint(path))
            .basic_auth(secret, Some(""))
            .json(&body)
            .send()
            .await
            .map_err(|err| GatewayError::Unreachable(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let payment: PaymentResponse = response
                .json()
                .await
                .map_err(|err| GatewayError::Unknown(format!("malformed success body: {err}")))?;
            return payment
                .payment_key
                .map(|transaction_id| ChargeReceipt { transaction_id })
                .ok_or_else(|| GatewayError::Unknown("success body missing paymentKey".into()));
        }

        let failure = response.json::<ProviderFailure>().await.ok();
        Err(classify_failure(status, failure))
    }
}

fn classify_failure(status: StatusCode, failure: Option<ProviderFailure>) -> GatewayError {
    let (code, message) = failure
        .map(|failure| (failure.code, failure.message))
        .unwrap_or((None, None));

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return GatewayError::ConfigMissing(
            message.unwrap_or_else(|| format!("gateway rejected credentials ({status})")),
        );
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return GatewayError::Unreachable(
            message.unwrap_or_else(|| format!("gateway responded {status}")),
        );
    }
    if status.is_client_error() {
        // Any other 4xx is a final answer from the provider.
        let code = code.unwrap_or_else(|| format!("HTTP_{}", status.as_u16()));
        return GatewayError::Declined {
            message: message.unwrap_or_else(|| format!("gateway rejected the request ({status})")),
            code,
        };
    }
    GatewayError::Unknown(format!(
        "status {status}: {}",
        message.unwrap_or_else(|| "no error body".into())
    ))
}

#[async_trait]
impl GatewayAdapter for HttpGatewayAdapter {
    async fn confirm(
        &self,
        transaction_ref: &str,
        order_id: &str,
        amount: i64,
    ) -> Result<ChargeReceipt, GatewayError> {
        self.post(
            "/v1/payments/confirm",
            json!({
                "paymentKey": transaction_ref,
                "orderId": order_id,
                "amount": amount,
            }),
        )
        .await
    }

    async fn charge_stored(&self, charge: &StoredCharge<'_>) -> Result<ChargeReceipt, GatewayError> {
        self.post(
            &format!("/v1/billing/{}", charge.credential),
            json!({
                "customerKey": charge.customer_ref,
                "amount": charge.amount,
                "orderId": charge.order_id,
                "orderName": charge.description,
            }),
        )
        .await
    }

    async fn cancel(
        &self,
        transaction_id: &str,
        reason: &str,
        amount: Option<i64>,
    ) -> Result<ChargeReceipt, GatewayError> {
        let mut body = json!({ "cancelReason": reason });
        if let Some(amount) = amount.filter(|amount| *amount > 0) {
            body["cancelAmount"] = json!(amount);
        }
        self.post(&format!("/v1/payments/{transaction_id}/cancel"), body)
            .await
    }
}
