use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use common_security::{Capability, SecurityCtxExtractor};

use crate::app::AppState;
use crate::ApiError;

/// Public site chrome: name, description, footer text. Every stored key is
/// world-readable; only writes are gated.
pub async fn get_settings(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
) -> Result<Json<BTreeMap<String, String>>, ApiError> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM site_settings")
        .fetch_all(&state.db)
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?;
    Ok(Json(rows.into_iter().collect()))
}

pub async fn save_settings(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Json(settings): Json<BTreeMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    state
        .policy
        .ensure(&sec, Capability::SettingsWrite)
        .map_err(|e| e.into_api(sec.trace_id))?;

    if settings.is_empty() {
        return Err(ApiError::bad_request("no_settings", sec.trace_id));
    }

    let mut tx = state
        .db
        .begin()
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?;
    for (key, value) in &settings {
        sqlx::query(
            "INSERT INTO site_settings (key, value, updated_at) VALUES ($1, $2, NOW())
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?;
    }
    tx.commit()
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?;

    Ok(StatusCode::NO_CONTENT)
}
