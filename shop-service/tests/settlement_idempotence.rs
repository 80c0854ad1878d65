#![cfg(feature = "integration-tests")]

use bigdecimal::BigDecimal;
use shop_service::fulfillment::{
    self, CreateOutcome, FulfillmentOutcome, NewOrder, OrderStatus, RedeliverOutcome, SettleOutcome,
};
use uuid::Uuid;

async fn run_migrations(pool: &sqlx::PgPool) {
    for stmt in [
        r#"CREATE TABLE IF NOT EXISTS products (
          id TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          description TEXT NOT NULL DEFAULT '',
          price NUMERIC(12,2) NOT NULL CHECK (price >= 0),
          category TEXT NULL,
          image TEXT NULL,
          active BOOLEAN NOT NULL DEFAULT TRUE,
          sort_order INTEGER NOT NULL DEFAULT 0,
          created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#,
        r#"CREATE TABLE IF NOT EXISTS cards (
          id BIGSERIAL PRIMARY KEY,
          product_id TEXT NOT NULL REFERENCES products(id) ON DELETE CASCADE,
          card_key TEXT NOT NULL,
          used BOOLEAN NOT NULL DEFAULT FALSE,
          used_at TIMESTAMPTZ NULL,
          created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
          UNIQUE (product_id, card_key),
          CHECK (used = (used_at IS NOT NULL))
        )"#,
        r#"CREATE TABLE IF NOT EXISTS orders (
          order_id TEXT PRIMARY KEY,
          product_id TEXT NOT NULL,
          product_name TEXT NOT NULL,
          amount NUMERIC(12,2) NOT NULL,
          buyer TEXT NULL,
          buyer_email TEXT NULL,
          status TEXT NOT NULL DEFAULT 'pending',
          trade_ref TEXT NULL,
          card_key TEXT NULL,
          refunded_card_key TEXT NULL,
          paid_at TIMESTAMPTZ NULL,
          delivered_at TIMESTAMPTZ NULL,
          refunded_at TIMESTAMPTZ NULL,
          created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#,
    ] {
        let _ = sqlx::query(stmt).execute(pool).await;
    }
}

async fn start_test_db() -> Option<sqlx::PgPool> {
    let url = match std::env::var("TEST_DATABASE_URL") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP settlement_idempotence: TEST_DATABASE_URL not set");
            return None;
        }
    };
    match sqlx::PgPool::connect(&url).await {
        Ok(pool) => {
            run_migrations(&pool).await;
            Some(pool)
        }
        Err(err) => {
            eprintln!("SKIP settlement_idempotence: cannot connect: {err}");
            None
        }
    }
}

async fn seed_product(pool: &sqlx::PgPool, product_id: &str) {
    sqlx::query("INSERT INTO products (id, name, price) VALUES ($1, 'Settle Pack', 10.00)")
        .bind(product_id)
        .execute(pool)
        .await
        .unwrap();
}

async fn seed_cards(pool: &sqlx::PgPool, product_id: &str, count: usize) {
    for i in 0..count {
        sqlx::query("INSERT INTO cards (product_id, card_key) VALUES ($1, $2)")
            .bind(product_id)
            .bind(format!("CARD-{i}-{product_id}"))
            .execute(pool)
            .await
            .unwrap();
    }
}

async fn seed_order(pool: &sqlx::PgPool, product_id: &str, order_id: &str) {
    let outcome = fulfillment::create_order(
        pool,
        NewOrder { order_id, product_id, buyer: Some("alice"), buyer_email: None },
    )
    .await
    .unwrap();
    assert!(matches!(outcome, CreateOutcome::Created(_)), "order seed failed");
}

fn amount(s: &str) -> BigDecimal {
    s.parse().unwrap()
}

#[tokio::test]
async fn second_callback_is_a_no_op() {
    let Some(pool) = start_test_db().await else { return };
    let run = Uuid::new_v4();
    let product_id = format!("settle-{run}");
    let order_id = format!("ord-{run}");
    seed_product(&pool, &product_id).await;
    seed_cards(&pool, &product_id, 1).await;
    seed_order(&pool, &product_id, &order_id).await;

    let first = fulfillment::settle(&pool, &order_id, "t1", &amount("10.00")).await.unwrap();
    let SettleOutcome::Settled { fulfillment: FulfillmentOutcome::Delivered { card_key } } = first
    else {
        panic!("expected delivery, got {first:?}")
    };

    let second = fulfillment::settle(&pool, &order_id, "t1", &amount("10.00")).await.unwrap();
    assert_eq!(second, SettleOutcome::AlreadySettled { status: OrderStatus::Delivered });

    // A fresh trade ref with the right amount is still a duplicate.
    let third = fulfillment::settle(&pool, &order_id, "t2", &amount("10.00")).await.unwrap();
    assert_eq!(third, SettleOutcome::AlreadySettled { status: OrderStatus::Delivered });

    let order = fulfillment::fetch_order(&pool, &order_id).await.unwrap().unwrap();
    assert_eq!(order.status, "delivered");
    assert_eq!(order.card_key.as_deref(), Some(card_key.as_str()));
    assert_eq!(order.trade_ref.as_deref(), Some("t1"));
    assert!(order.paid_at.is_some());
    assert!(order.delivered_at.is_some());
    assert_eq!(fulfillment::free_card_count(&pool, &product_id).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callbacks_converge() {
    let Some(pool) = start_test_db().await else { return };
    let run = Uuid::new_v4();
    let product_id = format!("concurrent-{run}");
    let order_id = format!("ord-{run}");
    seed_product(&pool, &product_id).await;
    seed_cards(&pool, &product_id, 2).await;
    seed_order(&pool, &product_id, &order_id).await;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let pool = pool.clone();
        let order_id = order_id.clone();
        handles.push(tokio::spawn(async move {
            fulfillment::settle(&pool, &order_id, "t1", &amount("10.00")).await.unwrap()
        }));
    }
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    // The row lock serializes them: one writer, one observer.
    let settled = outcomes.iter().filter(|o| matches!(o, SettleOutcome::Settled { .. })).count();
    let already =
        outcomes.iter().filter(|o| matches!(o, SettleOutcome::AlreadySettled { .. })).count();
    assert_eq!(settled, 1);
    assert_eq!(already, 1);

    let order = fulfillment::fetch_order(&pool, &order_id).await.unwrap().unwrap();
    assert_eq!(order.status, "delivered");
    assert!(order.card_key.is_some());
    assert_eq!(fulfillment::free_card_count(&pool, &product_id).await.unwrap(), 1);
}

#[tokio::test]
async fn mismatched_amount_never_mutates() {
    let Some(pool) = start_test_db().await else { return };
    let run = Uuid::new_v4();
    let product_id = format!("mismatch-{run}");
    let order_id = format!("ord-{run}");
    seed_product(&pool, &product_id).await;
    seed_cards(&pool, &product_id, 1).await;
    seed_order(&pool, &product_id, &order_id).await;

    let out = fulfillment::settle(&pool, &order_id, "t1", &amount("9.99")).await.unwrap();
    assert_eq!(out, SettleOutcome::AmountMismatch);
    let order = fulfillment::fetch_order(&pool, &order_id).await.unwrap().unwrap();
    assert_eq!(order.status, "pending");
    assert!(order.trade_ref.is_none());
    assert!(order.paid_at.is_none());
    assert_eq!(fulfillment::free_card_count(&pool, &product_id).await.unwrap(), 1);

    let out = fulfillment::settle(&pool, &order_id, "t1", &amount("10.00")).await.unwrap();
    assert!(matches!(out, SettleOutcome::Settled { .. }));

    // A wrong amount on a settled order is reported as a mismatch, not
    // shrugged off as a duplicate.
    let out = fulfillment::settle(&pool, &order_id, "t1", &amount("999.00")).await.unwrap();
    assert_eq!(out, SettleOutcome::AmountMismatch);
    let order = fulfillment::fetch_order(&pool, &order_id).await.unwrap().unwrap();
    assert_eq!(order.status, "delivered");
    assert!(order.card_key.is_some());
}

#[tokio::test]
async fn amount_comparison_ignores_scale() {
    let Some(pool) = start_test_db().await else { return };
    let run = Uuid::new_v4();
    let product_id = format!("scale-{run}");
    let order_id = format!("ord-{run}");
    seed_product(&pool, &product_id).await;
    seed_cards(&pool, &product_id, 1).await;
    seed_order(&pool, &product_id, &order_id).await;

    // The gateway reports "10"; the order holds 10.00.
    let out = fulfillment::settle(&pool, &order_id, "t1", &amount("10")).await.unwrap();
    assert!(matches!(out, SettleOutcome::Settled { .. }));
}

#[tokio::test]
async fn unknown_order_reports_not_found() {
    let Some(pool) = start_test_db().await else { return };
    let out = fulfillment::settle(&pool, &format!("ghost-{}", Uuid::new_v4()), "t1", &amount("1.00"))
        .await
        .unwrap();
    assert_eq!(out, SettleOutcome::OrderNotFound);
}

#[tokio::test]
async fn paid_order_waits_for_redeliver() {
    let Some(pool) = start_test_db().await else { return };
    let run = Uuid::new_v4();
    let product_id = format!("awaiting-{run}");
    let order_id = format!("ord-{run}");
    seed_product(&pool, &product_id).await;
    seed_order(&pool, &product_id, &order_id).await;

    // No stock: payment is kept, delivery deferred.
    let out = fulfillment::settle(&pool, &order_id, "t1", &amount("10.00")).await.unwrap();
    assert_eq!(out, SettleOutcome::Settled { fulfillment: FulfillmentOutcome::AwaitingStock });
    let order = fulfillment::fetch_order(&pool, &order_id).await.unwrap().unwrap();
    assert_eq!(order.status, "paid");
    assert!(order.card_key.is_none());
    assert!(order.paid_at.is_some());

    // A tampered amount is still flagged while the order waits.
    let out = fulfillment::settle(&pool, &order_id, "t1", &amount("9.00")).await.unwrap();
    assert_eq!(out, SettleOutcome::AmountMismatch);

    // Stock arrives. A duplicate callback still must not deliver; that is
    // the operator's redeliver call.
    seed_cards(&pool, &product_id, 1).await;
    let out = fulfillment::settle(&pool, &order_id, "t1", &amount("10.00")).await.unwrap();
    assert_eq!(out, SettleOutcome::AlreadySettled { status: OrderStatus::Paid });
    assert_eq!(fulfillment::free_card_count(&pool, &product_id).await.unwrap(), 1);

    let out = fulfillment::redeliver(&pool, &order_id).await.unwrap();
    let RedeliverOutcome::Delivered { card_key } = out else {
        panic!("expected redelivery, got {out:?}")
    };
    let order = fulfillment::fetch_order(&pool, &order_id).await.unwrap().unwrap();
    assert_eq!(order.status, "delivered");
    assert_eq!(order.card_key.as_deref(), Some(card_key.as_str()));

    // Redelivering a delivered order reports the held card without claiming
    // another.
    let again = fulfillment::redeliver(&pool, &order_id).await.unwrap();
    assert_eq!(again, RedeliverOutcome::Delivered { card_key });
    assert_eq!(fulfillment::free_card_count(&pool, &product_id).await.unwrap(), 0);
}

#[tokio::test]
async fn redeliver_rejects_unpaid_orders() {
    let Some(pool) = start_test_db().await else { return };
    let run = Uuid::new_v4();
    let product_id = format!("unpaid-{run}");
    let order_id = format!("ord-{run}");
    seed_product(&pool, &product_id).await;
    seed_cards(&pool, &product_id, 1).await;
    seed_order(&pool, &product_id, &order_id).await;

    let out = fulfillment::redeliver(&pool, &order_id).await.unwrap();
    assert_eq!(out, RedeliverOutcome::NotEligible { status: OrderStatus::Pending });
    assert_eq!(fulfillment::free_card_count(&pool, &product_id).await.unwrap(), 1);

    let out = fulfillment::redeliver(&pool, &format!("ghost-{run}")).await.unwrap();
    assert_eq!(out, RedeliverOutcome::OrderNotFound);
}
