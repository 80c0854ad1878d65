use std::str::FromStr;

use axum::extract::{Query, State};
use bigdecimal::BigDecimal;
use chrono::Utc;
use common_security::SecurityCtxExtractor;
use tracing::{info, warn};

use crate::app::AppState;
use crate::fulfillment::{self, FulfillmentOutcome, SettleOutcome};
use crate::metrics::SETTLEMENTS_TOTAL;
use crate::order_handlers::engine_error;
use crate::signature::{self, SignatureError};
use crate::ApiError;

pub use crate::signature::CallbackParams;

/// Gateway payment notification. The gateway redelivers until it sees the
/// literal "success" body, so every terminal business outcome acks with it
/// and only transient failures return 5xx.
pub async fn payment_callback(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Query(params): Query<CallbackParams>,
) -> Result<&'static str, ApiError> {
    if let Err(err) = signature::verify_callback(
        &state.gateway.secret,
        &params,
        Utc::now().timestamp(),
        state.gateway.max_skew_secs,
    ) {
        warn!(order_id = %params.order_id, %err, "rejected gateway callback");
        let code = match err {
            SignatureError::Mismatch => "sig_mismatch",
            SignatureError::SkewExceeded => "sig_skew",
        };
        return Err(ApiError::Unauthorized { code, trace_id: sec.trace_id });
    }

    let Ok(amount) = BigDecimal::from_str(&params.amount) else {
        warn!(order_id = %params.order_id, amount = %params.amount, "callback carries unparseable amount");
        return Err(ApiError::bad_request("invalid_amount", sec.trace_id));
    };

    let outcome = fulfillment::settle(&state.db, &params.order_id, &params.trade_ref, &amount)
        .await
        .map_err(|e| engine_error(e, sec.trace_id))?;

    match outcome {
        SettleOutcome::Settled { fulfillment } => {
            SETTLEMENTS_TOTAL.with_label_values(&["settled"]).inc();
            let delivery = match &fulfillment {
                FulfillmentOutcome::Delivered { .. } => "delivered",
                FulfillmentOutcome::AwaitingStock => "awaiting_stock",
            };
            info!(
                order_id = %params.order_id,
                trade_ref = %params.trade_ref,
                delivery,
                "payment settled"
            );
            Ok("success")
        }
        SettleOutcome::AlreadySettled { status } => {
            SETTLEMENTS_TOTAL.with_label_values(&["already_settled"]).inc();
            info!(
                order_id = %params.order_id,
                status = status.as_str(),
                "duplicate gateway callback"
            );
            Ok("success")
        }
        SettleOutcome::AmountMismatch => {
            SETTLEMENTS_TOTAL.with_label_values(&["amount_mismatch"]).inc();
            Err(ApiError::BadRequest {
                code: "amount_mismatch",
                trace_id: sec.trace_id,
                message: Some("reported amount does not match the order".into()),
            })
        }
        SettleOutcome::OrderNotFound => {
            SETTLEMENTS_TOTAL.with_label_values(&["order_not_found"]).inc();
            warn!(order_id = %params.order_id, "gateway callback for unknown order");
            Err(ApiError::NotFound { code: "order_not_found", trace_id: sec.trace_id })
        }
    }
}
