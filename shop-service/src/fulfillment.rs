// Order lifecycle and card allocation engine. Every public operation runs as
// one transaction; callers never observe a partially applied outcome.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::warn;

use crate::metrics::ALLOCATIONS_TOTAL;

/// Bound on the optimistic claim loop. Exceeding it means the free pool is
/// thrashing under concurrent claims; the whole operation is safe to retry.
pub const MAX_CLAIM_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Delivered,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Option<OrderStatus> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "paid" => Some(OrderStatus::Paid),
            "delivered" => Some(OrderStatus::Delivered),
            "refunded" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }
}

/// Valid transitions:
/// pending -> paid
/// paid -> delivered | refunded
/// delivered -> refunded
/// refunded is terminal.
pub fn is_valid_transition(from_status: &str, to: OrderStatus) -> bool {
    match OrderStatus::from_str(from_status) {
        Some(OrderStatus::Pending) => matches!(to, OrderStatus::Paid),
        Some(OrderStatus::Paid) => matches!(to, OrderStatus::Delivered | OrderStatus::Refunded),
        Some(OrderStatus::Delivered) => matches!(to, OrderStatus::Refunded),
        Some(OrderStatus::Refunded) => false,
        None => false,
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("card claim contention not resolved within the attempt bound")]
    Contention,
    #[error("integrity violation: {0}")]
    Integrity(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub order_id: String,
    pub product_id: String,
    pub product_name: String,
    pub amount: BigDecimal,
    pub buyer: Option<String>,
    pub buyer_email: Option<String>,
    pub status: String,
    pub trade_ref: Option<String>,
    pub card_key: Option<String>,
    pub refunded_card_key: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(String),
    OutOfStock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentOutcome {
    Delivered { card_key: String },
    /// Payment kept, no free card; the order stays paid until an admin
    /// redelivers or refunds it.
    AwaitingStock,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SettleOutcome {
    Settled { fulfillment: FulfillmentOutcome },
    AlreadySettled { status: OrderStatus },
    AmountMismatch,
    OrderNotFound,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RedeliverOutcome {
    Delivered { card_key: String },
    AwaitingStock,
    NotEligible { status: OrderStatus },
    OrderNotFound,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded { released_card: Option<String> },
    NotRefundable { status: OrderStatus },
    OrderNotFound,
}

pub struct NewOrder<'a> {
    pub order_id: &'a str,
    pub product_id: &'a str,
    pub buyer: Option<&'a str>,
    pub buyer_email: Option<&'a str>,
}

#[derive(Debug)]
pub enum CreateOutcome {
    Created(Order),
    ProductUnavailable,
    DuplicateOrder,
}

/// Create a pending order, snapshotting the product name and price so later
/// catalog edits never rewrite history. Inactive and unknown products both
/// come back as ProductUnavailable; a reused caller-supplied order id comes
/// back as DuplicateOrder and leaves the existing order untouched.
pub async fn create_order(db: &PgPool, new: NewOrder<'_>) -> Result<CreateOutcome, EngineError> {
    let rec = sqlx::query_as::<_, Order>(
        r#"INSERT INTO orders (order_id, product_id, product_name, amount, buyer, buyer_email)
           SELECT $1, p.id, p.name, p.price, $3, $4
           FROM products p WHERE p.id = $2 AND p.active
           ON CONFLICT (order_id) DO NOTHING
           RETURNING order_id, product_id, product_name, amount, buyer, buyer_email, status, trade_ref, card_key, refunded_card_key, paid_at, delivered_at, refunded_at, created_at"#,
    )
    .bind(new.order_id)
    .bind(new.product_id)
    .bind(new.buyer)
    .bind(new.buyer_email)
    .fetch_optional(db)
    .await?;
    if let Some(order) = rec {
        return Ok(CreateOutcome::Created(order));
    }
    let order_exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM orders WHERE order_id = $1)")
            .bind(new.order_id)
            .fetch_one(db)
            .await?;
    Ok(if order_exists {
        CreateOutcome::DuplicateOrder
    } else {
        CreateOutcome::ProductUnavailable
    })
}

pub async fn fetch_order(db: &PgPool, order_id: &str) -> Result<Option<Order>, EngineError> {
    let rec = sqlx::query_as::<_, Order>(
        r#"SELECT order_id, product_id, product_name, amount, buyer, buyer_email, status, trade_ref, card_key, refunded_card_key, paid_at, delivered_at, refunded_at, created_at
           FROM orders WHERE order_id = $1"#,
    )
    .bind(order_id)
    .fetch_optional(db)
    .await?;
    Ok(rec)
}

pub async fn free_card_count(db: &PgPool, product_id: &str) -> Result<i64, EngineError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM cards WHERE product_id = $1 AND used = FALSE",
    )
    .bind(product_id)
    .fetch_one(db)
    .await?;
    Ok(count)
}

async fn lock_order(
    tx: &mut Transaction<'_, Postgres>,
    order_id: &str,
) -> Result<Option<Order>, EngineError> {
    let rec = sqlx::query_as::<_, Order>(
        r#"SELECT order_id, product_id, product_name, amount, buyer, buyer_email, status, trade_ref, card_key, refunded_card_key, paid_at, delivered_at, refunded_at, created_at
           FROM orders WHERE order_id = $1 FOR UPDATE"#,
    )
    .bind(order_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(rec)
}

fn order_status(order: &Order) -> Result<OrderStatus, EngineError> {
    OrderStatus::from_str(&order.status).ok_or_else(|| {
        EngineError::Integrity(format!(
            "order {} carries unknown status {}",
            order.order_id, order.status
        ))
    })
}

/// Claim exactly one free card for the product, or report exhaustion.
///
/// SKIP LOCKED hands concurrent claimers distinct candidate rows, so the
/// contention unit is a single card row, never the whole pool. An empty
/// candidate read is disambiguated with an existence probe: no free row at
/// all means OutOfStock, free rows that are merely claim-locked mean another
/// attempt.
pub async fn claim_free_card(
    tx: &mut Transaction<'_, Postgres>,
    product_id: &str,
) -> Result<ClaimOutcome, EngineError> {
    for _ in 0..MAX_CLAIM_ATTEMPTS {
        let candidate: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM cards WHERE product_id = $1 AND used = FALSE ORDER BY id LIMIT 1 FOR UPDATE SKIP LOCKED",
        )
        .bind(product_id)
        .fetch_optional(&mut **tx)
        .await?;

        match candidate {
            Some(card_id) => {
                let claimed: Option<String> = sqlx::query_scalar(
                    "UPDATE cards SET used = TRUE, used_at = NOW() WHERE id = $1 AND used = FALSE RETURNING card_key",
                )
                .bind(card_id)
                .fetch_optional(&mut **tx)
                .await?;
                match claimed {
                    Some(card_key) => {
                        ALLOCATIONS_TOTAL.with_label_values(&["claimed"]).inc();
                        return Ok(ClaimOutcome::Claimed(card_key));
                    }
                    // Candidate went to a faster claimer; take another row.
                    None => continue,
                }
            }
            None => {
                let any_free: bool = sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM cards WHERE product_id = $1 AND used = FALSE)",
                )
                .bind(product_id)
                .fetch_one(&mut **tx)
                .await?;
                if !any_free {
                    ALLOCATIONS_TOTAL.with_label_values(&["out_of_stock"]).inc();
                    return Ok(ClaimOutcome::OutOfStock);
                }
                // Free rows exist but every candidate is locked by an
                // in-flight claim; try again within the bound.
            }
        }
    }
    warn!(product_id = %product_id, attempts = MAX_CLAIM_ATTEMPTS, "card claim still contended");
    ALLOCATIONS_TOTAL.with_label_values(&["contention"]).inc();
    Err(EngineError::Contention)
}

/// Process one gateway callback. Idempotent under arbitrary redelivery: the
/// order row lock serializes duplicate callbacks and only the first writer
/// performs the pending -> paid transition; everyone else observes the
/// settled state and reports AlreadySettled without side effects.
pub async fn settle(
    db: &PgPool,
    order_id: &str,
    trade_ref: &str,
    reported_amount: &BigDecimal,
) -> Result<SettleOutcome, EngineError> {
    let mut tx = db.begin().await?;

    let Some(order) = lock_order(&mut tx, order_id).await? else {
        return Ok(SettleOutcome::OrderNotFound);
    };

    if !common_money::amounts_equal(&order.amount, reported_amount) {
        warn!(
            order_id = %order.order_id,
            expected = %order.amount,
            reported = %reported_amount,
            "callback amount mismatch"
        );
        return Ok(SettleOutcome::AmountMismatch);
    }

    let status = order_status(&order)?;
    if status != OrderStatus::Pending {
        return Ok(SettleOutcome::AlreadySettled { status });
    }

    let updated = sqlx::query(
        "UPDATE orders SET status = 'paid', trade_ref = $2, paid_at = NOW() WHERE order_id = $1 AND status = 'pending'",
    )
    .bind(&order.order_id)
    .bind(trade_ref)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(EngineError::Integrity(format!(
            "order {} changed under its row lock during settlement",
            order.order_id
        )));
    }

    let fulfillment = fulfill_locked(&mut tx, &order).await?;
    tx.commit().await?;
    Ok(SettleOutcome::Settled { fulfillment })
}

/// Deliver a paid order: claim a card and stamp it onto the order. Expects
/// the order row locked by the caller. Re-runnable: an order that already
/// holds a card only gets its status completed, never a second card.
async fn fulfill_locked(
    tx: &mut Transaction<'_, Postgres>,
    order: &Order,
) -> Result<FulfillmentOutcome, EngineError> {
    if let Some(card_key) = order.card_key.as_deref() {
        sqlx::query(
            "UPDATE orders SET status = 'delivered', delivered_at = COALESCE(delivered_at, NOW()) WHERE order_id = $1",
        )
        .bind(&order.order_id)
        .execute(&mut **tx)
        .await?;
        return Ok(FulfillmentOutcome::Delivered { card_key: card_key.to_string() });
    }

    match claim_free_card(tx, &order.product_id).await? {
        ClaimOutcome::Claimed(card_key) => {
            sqlx::query(
                "UPDATE orders SET status = 'delivered', card_key = $2, delivered_at = NOW() WHERE order_id = $1 AND status = 'paid'",
            )
            .bind(&order.order_id)
            .bind(&card_key)
            .execute(&mut **tx)
            .await?;
            Ok(FulfillmentOutcome::Delivered { card_key })
        }
        ClaimOutcome::OutOfStock => {
            warn!(order_id = %order.order_id, product_id = %order.product_id, "paid order awaiting stock");
            Ok(FulfillmentOutcome::AwaitingStock)
        }
    }
}

/// Re-run fulfillment for an order owed stock. A delivered order reports its
/// existing card; pending and refunded orders are not eligible.
pub async fn redeliver(db: &PgPool, order_id: &str) -> Result<RedeliverOutcome, EngineError> {
    let mut tx = db.begin().await?;

    let Some(order) = lock_order(&mut tx, order_id).await? else {
        return Ok(RedeliverOutcome::OrderNotFound);
    };

    let status = order_status(&order)?;
    match status {
        OrderStatus::Pending | OrderStatus::Refunded => {
            Ok(RedeliverOutcome::NotEligible { status })
        }
        OrderStatus::Delivered => {
            let card_key = order.card_key.clone().ok_or_else(|| {
                EngineError::Integrity(format!("order {} is delivered without a card", order.order_id))
            })?;
            Ok(RedeliverOutcome::Delivered { card_key })
        }
        OrderStatus::Paid => {
            let outcome = match fulfill_locked(&mut tx, &order).await? {
                FulfillmentOutcome::Delivered { card_key } => RedeliverOutcome::Delivered { card_key },
                FulfillmentOutcome::AwaitingStock => RedeliverOutcome::AwaitingStock,
            };
            tx.commit().await?;
            Ok(outcome)
        }
    }
}

/// Reverse a paid or delivered order. The card release and the status flip
/// commit together or not at all; a card row that cannot be flipped back is
/// an integrity violation and fails the refund loudly.
pub async fn refund(db: &PgPool, order_id: &str) -> Result<RefundOutcome, EngineError> {
    let mut tx = db.begin().await?;

    let Some(order) = lock_order(&mut tx, order_id).await? else {
        return Ok(RefundOutcome::OrderNotFound);
    };

    let status = order_status(&order)?;
    if !is_valid_transition(&order.status, OrderStatus::Refunded) {
        return Ok(RefundOutcome::NotRefundable { status });
    }

    let released_card = match order.card_key.as_deref() {
        Some(card_key) => {
            let released = sqlx::query(
                "UPDATE cards SET used = FALSE, used_at = NULL WHERE product_id = $1 AND card_key = $2 AND used = TRUE",
            )
            .bind(&order.product_id)
            .bind(card_key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if released == 0 {
                return Err(EngineError::Integrity(format!(
                    "card {} held by order {} is missing or already free",
                    card_key, order.order_id
                )));
            }
            Some(card_key.to_string())
        }
        None => None,
    };

    sqlx::query(
        "UPDATE orders SET status = 'refunded', card_key = NULL, refunded_card_key = $2, refunded_at = NOW() WHERE order_id = $1",
    )
    .bind(&order.order_id)
    .bind(&released_card)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(RefundOutcome::Refunded { released_card })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for s in [OrderStatus::Pending, OrderStatus::Paid, OrderStatus::Delivered, OrderStatus::Refunded] {
            assert_eq!(OrderStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(OrderStatus::from_str("voided"), None);
    }

    #[test]
    fn transition_matrix() {
        assert!(is_valid_transition("pending", OrderStatus::Paid));
        assert!(!is_valid_transition("pending", OrderStatus::Delivered));
        assert!(!is_valid_transition("pending", OrderStatus::Refunded));

        assert!(is_valid_transition("paid", OrderStatus::Delivered));
        assert!(is_valid_transition("paid", OrderStatus::Refunded));
        assert!(!is_valid_transition("paid", OrderStatus::Paid));

        assert!(is_valid_transition("delivered", OrderStatus::Refunded));
        assert!(!is_valid_transition("delivered", OrderStatus::Paid));

        assert!(!is_valid_transition("refunded", OrderStatus::Paid));
        assert!(!is_valid_transition("refunded", OrderStatus::Delivered));
        assert!(!is_valid_transition("refunded", OrderStatus::Refunded));

        assert!(!is_valid_transition("garbage", OrderStatus::Paid));
    }
}
