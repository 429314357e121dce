use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;

use super::gateway::new_order_id;
use super::models::NewPurchaseOrder;
use super::store::{InsertOutcome, LedgerStore};

const ORDER_ID_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("invalid order request: {0}")]
    Validation(String),
    #[error("product not found")]
    NotFound,
    #[error("product cannot be purchased: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePurchaseOrder {
    pub product_id: Option<Uuid>,
    #[serde(default)]
    pub session_id: Option<Uuid>,
}

/// What the buyer's client hands to the payment widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedOrder {
    pub order_id: String,
    pub amount: i64,
    pub order_name: String,
}

/// key: purchase-order-creation -> PENDING order with a server-priced amount
///
/// The amount comes from the product row, never from the buyer; confirmation later
/// checks the client's claimed amount against it.
pub async fn create_purchase_order(
    store: &dyn LedgerStore,
    clock: &dyn Clock,
    buyer_id: Uuid,
    request: CreatePurchaseOrder,
) -> Result<CreatedOrder, OrderError> {
    let product_id = request
        .product_id
        .ok_or_else(|| OrderError::Validation("product_id is required".into()))?;
    let product = store
        .product(product_id)
        .await?
        .ok_or(OrderError::NotFound)?;
    if !product.is_on_sale {
        return Err(OrderError::Unavailable("product is not on sale".into()));
    }
    if !product.is_public {
        return Err(OrderError::Unavailable(
            "private products are issued by the academy".into(),
        ));
    }
    if product.price <= 0 {
        return Err(OrderError::Unavailable("product has no payable price".into()));
    }

    for _ in 0..ORDER_ID_ATTEMPTS {
        let order_id = new_order_id("tk", product.academy_id);
        let order =
            NewPurchaseOrder::for_product(order_id.clone(), buyer_id, &product, request.session_id);
        match store.create_order(order, clock.now()).await? {
            InsertOutcome::Inserted(order) => {
                info!(
                    order_id = %order.order_id,
                    buyer = %buyer_id,
                    product = %product.id,
                    amount = order.amount,
                    "purchase order created"
                );
                return Ok(CreatedOrder {
                    order_id: order.order_id,
                    amount: order.amount,
                    order_name: product.name,
                });
            }
            InsertOutcome::Conflict => {
                warn!(%order_id, "generated order id already taken; retrying");
            }
        }
    }
    Err(OrderError::Internal(anyhow::anyhow!(
        "could not allocate a unique order id"
    )))
}
