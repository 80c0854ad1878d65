use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use common_money::{non_negative, normalize_scale};
use common_security::{Capability, SecurityCtxExtractor};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::app::AppState;
use crate::ApiError;

/// Catalog row plus the free-card count backing the "in stock" badge. The
/// count is read-only and may lag allocations in flight.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ProductView {
    pub id: String,
    pub name: String,
    pub description: String,
    pub price: BigDecimal,
    pub category: Option<String>,
    pub image: Option<String>,
    pub active: bool,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
    pub stock: i64,
}

async fn product_view(db: &PgPool, product_id: &str) -> Result<Option<ProductView>, sqlx::Error> {
    sqlx::query_as::<_, ProductView>(
        r#"SELECT p.id, p.name, p.description, p.price, p.category, p.image, p.active, p.sort_order, p.created_at,
                  COALESCE(c.free, 0) AS stock
           FROM products p
           LEFT JOIN (SELECT product_id, COUNT(*) FILTER (WHERE NOT used) AS free FROM cards GROUP BY product_id) c
             ON c.product_id = p.id
           WHERE p.id = $1"#,
    )
    .bind(product_id)
    .fetch_optional(db)
    .await
}

/// Storefront catalog. Admin callers also see inactive products so the
/// console can toggle them back on.
pub async fn list_products(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
) -> Result<Json<Vec<ProductView>>, ApiError> {
    let include_inactive = sec
        .user
        .as_ref()
        .map(|u| state.policy.is_admin(&u.username))
        .unwrap_or(false);

    let products = sqlx::query_as::<_, ProductView>(
        r#"SELECT p.id, p.name, p.description, p.price, p.category, p.image, p.active, p.sort_order, p.created_at,
                  COALESCE(c.free, 0) AS stock
           FROM products p
           LEFT JOIN (SELECT product_id, COUNT(*) FILTER (WHERE NOT used) AS free FROM cards GROUP BY product_id) c
             ON c.product_id = p.id
           WHERE p.active OR $1
           ORDER BY p.sort_order, p.created_at"#,
    )
    .bind(include_inactive)
    .fetch_all(&state.db)
    .await
    .map_err(|e| ApiError::internal(e, sec.trace_id))?;

    Ok(Json(products))
}

pub async fn get_product(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Path(product_id): Path<String>,
) -> Result<Json<ProductView>, ApiError> {
    let product = product_view(&state.db, &product_id)
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?;
    match product {
        Some(p) => Ok(Json(p)),
        None => Err(ApiError::NotFound { code: "product_not_found", trace_id: sec.trace_id }),
    }
}

#[derive(Deserialize)]
pub struct UpsertProduct {
    /// Generated when absent; supplying an existing id updates that product.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub price: BigDecimal,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub sort_order: Option<i32>,
}

pub async fn upsert_product(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Json(upsert): Json<UpsertProduct>,
) -> Result<Json<ProductView>, ApiError> {
    state
        .policy
        .ensure(&sec, Capability::CatalogWrite)
        .map_err(|e| e.into_api(sec.trace_id))?;

    if upsert.name.trim().is_empty() {
        return Err(ApiError::bad_request("empty_name", sec.trace_id));
    }
    if !non_negative(&upsert.price) {
        return Err(ApiError::BadRequest {
            code: "invalid_price",
            trace_id: sec.trace_id,
            message: Some("price must be zero or positive".into()),
        });
    }

    let id = upsert
        .id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // active and sort_order keep their stored values when the payload omits
    // them; their dedicated toggle endpoints own those fields.
    sqlx::query(
        r#"INSERT INTO products (id, name, description, price, category, image, active, sort_order)
           VALUES ($1, $2, $3, $4, $5, $6, COALESCE($7, TRUE), COALESCE($8, 0))
           ON CONFLICT (id) DO UPDATE SET
               name = EXCLUDED.name,
               description = EXCLUDED.description,
               price = EXCLUDED.price,
               category = EXCLUDED.category,
               image = EXCLUDED.image,
               active = COALESCE($7, products.active),
               sort_order = COALESCE($8, products.sort_order)"#,
    )
    .bind(&id)
    .bind(upsert.name.trim())
    .bind(upsert.description.unwrap_or_default())
    .bind(normalize_scale(&upsert.price))
    .bind(&upsert.category)
    .bind(&upsert.image)
    .bind(upsert.active)
    .bind(upsert.sort_order)
    .execute(&state.db)
    .await
    .map_err(|e| ApiError::internal(e, sec.trace_id))?;

    let product = product_view(&state.db, &id)
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?
        .ok_or(ApiError::Internal {
            trace_id: sec.trace_id,
            message: Some("upserted product disappeared".into()),
        })?;
    Ok(Json(product))
}

pub async fn delete_product(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Path(product_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .policy
        .ensure(&sec, Capability::CatalogWrite)
        .map_err(|e| e.into_api(sec.trace_id))?;

    let result = sqlx::query("DELETE FROM products WHERE id = $1")
        .bind(&product_id)
        .execute(&state.db)
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?;
    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound { code: "product_not_found", trace_id: sec.trace_id });
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct SetActive {
    pub active: bool,
}

pub async fn set_product_active(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Path(product_id): Path<String>,
    Json(body): Json<SetActive>,
) -> Result<StatusCode, ApiError> {
    state
        .policy
        .ensure(&sec, Capability::CatalogWrite)
        .map_err(|e| e.into_api(sec.trace_id))?;

    let result = sqlx::query("UPDATE products SET active = $1 WHERE id = $2")
        .bind(body.active)
        .bind(&product_id)
        .execute(&state.db)
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?;
    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound { code: "product_not_found", trace_id: sec.trace_id });
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct SetSortOrder {
    pub sort_order: i32,
}

/// The console swaps display positions with one call per product; a racing
/// pair of swaps can interleave and is corrected by the next reorder.
pub async fn set_product_sort(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Path(product_id): Path<String>,
    Json(body): Json<SetSortOrder>,
) -> Result<StatusCode, ApiError> {
    state
        .policy
        .ensure(&sec, Capability::CatalogWrite)
        .map_err(|e| e.into_api(sec.trace_id))?;

    let result = sqlx::query("UPDATE products SET sort_order = $1 WHERE id = $2")
        .bind(body.sort_order)
        .bind(&product_id)
        .execute(&state.db)
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?;
    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound { code: "product_not_found", trace_id: sec.trace_id });
    }
    Ok(StatusCode::NO_CONTENT)
}
