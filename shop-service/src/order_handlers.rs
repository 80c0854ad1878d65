use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use common_money::NormalizedMoney;
use common_security::{Capability, SecurityCtxExtractor};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::app::AppState;
use crate::fulfillment::{
    self, CreateOutcome, EngineError, NewOrder, Order, RedeliverOutcome, RefundOutcome,
};
use crate::metrics::{INTEGRITY_VIOLATIONS_TOTAL, ORDERS_CREATED_TOTAL, REFUNDS_TOTAL};
use crate::signature;
use crate::ApiError;

/// Engine failures that reach HTTP. Contention and store errors map to 500
/// so the caller retries; integrity violations are logged and counted before
/// the 500 goes out.
pub(crate) fn engine_error(err: EngineError, trace_id: Option<Uuid>) -> ApiError {
    match err {
        EngineError::Contention => ApiError::Internal {
            trace_id,
            message: Some("card claim contention; retry".into()),
        },
        EngineError::Integrity(detail) => {
            error!(%detail, "order/card integrity violation");
            INTEGRITY_VIOLATIONS_TOTAL.with_label_values(&["engine"]).inc();
            ApiError::Internal { trace_id, message: Some(detail) }
        }
        EngineError::Db(e) => ApiError::internal(e, trace_id),
    }
}

#[derive(Deserialize)]
pub struct CheckoutRequest {
    pub product_id: String,
    /// Optional caller-supplied order token; generated when absent.
    #[serde(default)]
    pub order_id: Option<String>,
}

#[derive(Serialize)]
pub struct CheckoutResponse {
    pub order: Order,
    pub pay_url: String,
}

/// Checkout initiation: records the pending order with its price snapshot
/// and hands back the signed gateway redirect. No card is touched here;
/// allocation happens at settlement.
pub async fn create_order(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let buyer = sec.require_user().map_err(|e| e.into_api(sec.trace_id))?;

    let order_id = req
        .order_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let outcome = fulfillment::create_order(
        &state.db,
        NewOrder {
            order_id: &order_id,
            product_id: &req.product_id,
            buyer: Some(&buyer.username),
            buyer_email: buyer.email.as_deref(),
        },
    )
    .await
    .map_err(|e| engine_error(e, sec.trace_id))?;

    let order = match outcome {
        CreateOutcome::Created(order) => order,
        CreateOutcome::ProductUnavailable => {
            return Err(ApiError::NotFound { code: "product_unavailable", trace_id: sec.trace_id })
        }
        CreateOutcome::DuplicateOrder => {
            return Err(ApiError::conflict("order_exists", sec.trace_id))
        }
    };

    ORDERS_CREATED_TOTAL.inc();
    info!(
        order_id = %order.order_id,
        product_id = %order.product_id,
        buyer = %buyer.username,
        "order created"
    );

    let amount = NormalizedMoney::new(order.amount.clone()).to_plain_string();
    let pay_url = signature::build_pay_url(
        &state.gateway.pay_base_url,
        &state.gateway.secret,
        &order.order_id,
        &amount,
        Utc::now().timestamp(),
    );
    Ok(Json(CheckoutResponse { order, pay_url }))
}

/// Single order view for the owning buyer. Non-owners get the same answer
/// as a missing order so order ids stay unprobeable; admins can see any.
pub async fn get_order(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Path(order_id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let order = fulfillment::fetch_order(&state.db, &order_id)
        .await
        .map_err(|e| engine_error(e, sec.trace_id))?
        .ok_or(ApiError::NotFound { code: "order_not_found", trace_id: sec.trace_id })?;

    let caller = sec.user.as_ref();
    let owns = matches!(
        (order.buyer.as_deref(), caller),
        (Some(owner), Some(user)) if owner == user.username
    );
    let is_admin = caller.map(|u| state.policy.is_admin(&u.username)).unwrap_or(false);
    if !owns && !is_admin {
        return Err(ApiError::NotFound { code: "order_not_found", trace_id: sec.trace_id });
    }
    Ok(Json(order))
}

pub async fn list_my_orders(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
) -> Result<Json<Vec<Order>>, ApiError> {
    let buyer = sec.require_user().map_err(|e| e.into_api(sec.trace_id))?;

    let orders = sqlx::query_as::<_, Order>(
        r#"SELECT order_id, product_id, product_name, amount, buyer, buyer_email, status, trade_ref, card_key, refunded_card_key, paid_at, delivered_at, refunded_at, created_at
           FROM orders WHERE buyer = $1 ORDER BY created_at DESC"#,
    )
    .bind(&buyer.username)
    .fetch_all(&state.db)
    .await
    .map_err(|e| ApiError::internal(e, sec.trace_id))?;

    Ok(Json(orders))
}

pub async fn admin_list_orders(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
) -> Result<Json<Vec<Order>>, ApiError> {
    state
        .policy
        .ensure(&sec, Capability::OrderInspect)
        .map_err(|e| e.into_api(sec.trace_id))?;

    let orders = sqlx::query_as::<_, Order>(
        r#"SELECT order_id, product_id, product_name, amount, buyer, buyer_email, status, trade_ref, card_key, refunded_card_key, paid_at, delivered_at, refunded_at, created_at
           FROM orders ORDER BY created_at DESC"#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(|e| ApiError::internal(e, sec.trace_id))?;

    Ok(Json(orders))
}

#[derive(Serialize)]
pub struct RefundResponse {
    pub order_id: String,
    pub status: &'static str,
    pub released_card: Option<String>,
}

pub async fn refund_order(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Path(order_id): Path<String>,
) -> Result<Json<RefundResponse>, ApiError> {
    let actor = state
        .policy
        .ensure(&sec, Capability::OrderRefund)
        .map_err(|e| e.into_api(sec.trace_id))?;

    match fulfillment::refund(&state.db, &order_id)
        .await
        .map_err(|e| engine_error(e, sec.trace_id))?
    {
        RefundOutcome::Refunded { released_card } => {
            REFUNDS_TOTAL.with_label_values(&["refunded"]).inc();
            info!(
                order_id = %order_id,
                actor = %actor.username,
                card_released = released_card.is_some(),
                "order refunded"
            );
            Ok(Json(RefundResponse { order_id, status: "refunded", released_card }))
        }
        RefundOutcome::NotRefundable { status } => {
            REFUNDS_TOTAL.with_label_values(&["not_refundable"]).inc();
            Err(ApiError::Conflict {
                code: "not_refundable",
                trace_id: sec.trace_id,
                message: Some(format!("order in status {} cannot be refunded", status.as_str())),
            })
        }
        RefundOutcome::OrderNotFound => {
            Err(ApiError::NotFound { code: "order_not_found", trace_id: sec.trace_id })
        }
    }
}

#[derive(Serialize)]
pub struct RedeliverResponse {
    pub order_id: String,
    pub status: &'static str,
    pub card_key: String,
}

/// Re-runs the fulfillment step for a paid order owed stock, typically after
/// a card import or a refund freed inventory.
pub async fn redeliver_order(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Path(order_id): Path<String>,
) -> Result<Json<RedeliverResponse>, ApiError> {
    let actor = state
        .policy
        .ensure(&sec, Capability::OrderRedeliver)
        .map_err(|e| e.into_api(sec.trace_id))?;

    match fulfillment::redeliver(&state.db, &order_id)
        .await
        .map_err(|e| engine_error(e, sec.trace_id))?
    {
        RedeliverOutcome::Delivered { card_key } => {
            info!(order_id = %order_id, actor = %actor.username, "order redelivered");
            Ok(Json(RedeliverResponse { order_id, status: "delivered", card_key }))
        }
        RedeliverOutcome::AwaitingStock => Err(ApiError::Conflict {
            code: "out_of_stock",
            trace_id: sec.trace_id,
            message: Some("no free card for the product; order stays paid".into()),
        }),
        RedeliverOutcome::NotEligible { status } => Err(ApiError::Conflict {
            code: "not_redeliverable",
            trace_id: sec.trace_id,
            message: Some(format!("order in status {} is not owed delivery", status.as_str())),
        }),
        RedeliverOutcome::OrderNotFound => {
            Err(ApiError::NotFound { code: "order_not_found", trace_id: sec.trace_id })
        }
    }
}
