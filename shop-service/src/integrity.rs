// Background orphan scan. A correct engine can never produce the states
// counted here; any hit is alerting signal for an atomicity bug and is never
// auto-repaired.

use std::env;
use std::time::Duration;

use sqlx::PgPool;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::metrics::INTEGRITY_ORPHANS;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub delivered_without_card: i64,
    pub orphaned_used_cards: i64,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.delivered_without_card == 0 && self.orphaned_used_cards == 0
    }
}

pub async fn sweep_once(db: &PgPool) -> Result<IntegrityReport, sqlx::Error> {
    let delivered_without_card: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM orders WHERE status = 'delivered' AND card_key IS NULL",
    )
    .fetch_one(db)
    .await?;

    let orphaned_used_cards: i64 = sqlx::query_scalar(
        r#"SELECT COUNT(*) FROM cards c
           WHERE c.used
             AND NOT EXISTS (
               SELECT 1 FROM orders o
               WHERE o.product_id = c.product_id
                 AND o.card_key = c.card_key
                 AND o.status <> 'refunded'
             )"#,
    )
    .fetch_one(db)
    .await?;

    let report = IntegrityReport { delivered_without_card, orphaned_used_cards };
    INTEGRITY_ORPHANS
        .with_label_values(&["delivered_without_card"])
        .set(report.delivered_without_card);
    INTEGRITY_ORPHANS
        .with_label_values(&["orphaned_used_card"])
        .set(report.orphaned_used_cards);

    if report.delivered_without_card > 0 {
        error!(count = report.delivered_without_card, "delivered orders without a card");
    }
    if report.orphaned_used_cards > 0 {
        error!(count = report.orphaned_used_cards, "used cards not referenced by any live order");
    }
    Ok(report)
}

pub fn spawn_integrity_sweeper(db: PgPool) {
    let sweep_secs = env::var("INTEGRITY_SWEEP_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(300)
        .max(30);
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(sweep_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sweep_once(&db).await {
                Ok(report) if report.is_clean() => {
                    debug!("integrity sweep clean");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "integrity sweep failed");
                }
            }
        }
    });
}
