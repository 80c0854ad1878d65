use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use common_security::{Capability, SecurityCtxExtractor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::app::AppState;
use crate::ApiError;

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct CardRow {
    pub id: i64,
    pub product_id: String,
    pub card_key: String,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct CardListQuery {
    pub product_id: Option<String>,
}

pub async fn list_cards(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Query(query): Query<CardListQuery>,
) -> Result<Json<Vec<CardRow>>, ApiError> {
    state
        .policy
        .ensure(&sec, Capability::CardAdmin)
        .map_err(|e| e.into_api(sec.trace_id))?;

    let Some(product_id) = query.product_id else {
        return Err(ApiError::bad_request("missing_product_id", sec.trace_id));
    };

    let cards = sqlx::query_as::<_, CardRow>(
        "SELECT id, product_id, card_key, used, used_at, created_at FROM cards WHERE product_id = $1 ORDER BY id",
    )
    .bind(&product_id)
    .fetch_all(&state.db)
    .await
    .map_err(|e| ApiError::internal(e, sec.trace_id))?;

    Ok(Json(cards))
}

#[derive(Deserialize)]
pub struct ImportCards {
    pub product_id: String,
    /// Newline-separated key block as pasted into the console form.
    pub keys: String,
}

#[derive(Serialize)]
pub struct ImportReport {
    pub received: u64,
    pub inserted: u64,
    pub skipped: u64,
}

/// Bulk key import. Lines are trimmed, blanks dropped, and keys already
/// present for the product skipped (including duplicates within the batch),
/// all inside one transaction.
pub async fn import_cards(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Json(import): Json<ImportCards>,
) -> Result<Json<ImportReport>, ApiError> {
    let actor = state
        .policy
        .ensure(&sec, Capability::CardAdmin)
        .map_err(|e| e.into_api(sec.trace_id))?;

    let keys: Vec<&str> = import
        .keys
        .lines()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .collect();
    if keys.is_empty() {
        return Err(ApiError::bad_request("no_keys", sec.trace_id));
    }

    let mut tx = state
        .db
        .begin()
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?;

    let product_exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM products WHERE id = $1)")
            .bind(&import.product_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| ApiError::internal(e, sec.trace_id))?;
    if !product_exists {
        return Err(ApiError::NotFound { code: "product_not_found", trace_id: sec.trace_id });
    }

    let mut inserted = 0u64;
    for key in &keys {
        let result = sqlx::query(
            "INSERT INTO cards (product_id, card_key) VALUES ($1, $2) ON CONFLICT (product_id, card_key) DO NOTHING",
        )
        .bind(&import.product_id)
        .bind(key)
        .execute(&mut *tx)
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?;
        inserted += result.rows_affected();
    }

    tx.commit()
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?;

    let received = keys.len() as u64;
    info!(
        product_id = %import.product_id,
        actor = %actor.username,
        received,
        inserted,
        "card import"
    );
    Ok(Json(ImportReport { received, inserted, skipped: received - inserted }))
}

/// Deleting a used card would orphan the order holding it, so only free
/// cards are deletable.
pub async fn delete_card(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Path(card_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state
        .policy
        .ensure(&sec, Capability::CardAdmin)
        .map_err(|e| e.into_api(sec.trace_id))?;

    let deleted = sqlx::query("DELETE FROM cards WHERE id = $1 AND used = FALSE")
        .bind(card_id)
        .execute(&state.db)
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?
        .rows_affected();
    if deleted == 1 {
        return Ok(StatusCode::NO_CONTENT);
    }

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM cards WHERE id = $1)")
        .bind(card_id)
        .fetch_one(&state.db)
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?;
    if exists {
        Err(ApiError::Conflict {
            code: "card_used",
            trace_id: sec.trace_id,
            message: Some("cannot delete a used card".into()),
        })
    } else {
        Err(ApiError::NotFound { code: "card_not_found", trace_id: sec.trace_id })
    }
}
