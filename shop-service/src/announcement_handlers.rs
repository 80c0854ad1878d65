use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use common_security::{Capability, SecurityCtxExtractor};
use serde::{Deserialize, Serialize};

use crate::app::AppState;
use crate::ApiError;

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct Announcement {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub active: bool,
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Active announcements, pinned first, newest within each group.
pub async fn list_announcements(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
) -> Result<Json<Vec<Announcement>>, ApiError> {
    let rows = sqlx::query_as::<_, Announcement>(
        "SELECT id, title, content, active, pinned, created_at, updated_at FROM announcements WHERE active ORDER BY pinned DESC, created_at DESC",
    )
    .fetch_all(&state.db)
    .await
    .map_err(|e| ApiError::internal(e, sec.trace_id))?;
    Ok(Json(rows))
}

#[derive(Deserialize)]
pub struct NewAnnouncement {
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub pinned: Option<bool>,
}

pub async fn create_announcement(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Json(new): Json<NewAnnouncement>,
) -> Result<Json<Announcement>, ApiError> {
    state
        .policy
        .ensure(&sec, Capability::AnnouncementWrite)
        .map_err(|e| e.into_api(sec.trace_id))?;

    if new.title.trim().is_empty() {
        return Err(ApiError::bad_request("empty_title", sec.trace_id));
    }

    let announcement = sqlx::query_as::<_, Announcement>(
        r#"INSERT INTO announcements (title, content, pinned) VALUES ($1, $2, COALESCE($3, FALSE))
           RETURNING id, title, content, active, pinned, created_at, updated_at"#,
    )
    .bind(new.title.trim())
    .bind(new.content.unwrap_or_default())
    .bind(new.pinned)
    .fetch_one(&state.db)
    .await
    .map_err(|e| ApiError::internal(e, sec.trace_id))?;

    Ok(Json(announcement))
}

pub async fn delete_announcement(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Path(announcement_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state
        .policy
        .ensure(&sec, Capability::AnnouncementWrite)
        .map_err(|e| e.into_api(sec.trace_id))?;

    let result = sqlx::query("DELETE FROM announcements WHERE id = $1")
        .bind(announcement_id)
        .execute(&state.db)
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?;
    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound { code: "announcement_not_found", trace_id: sec.trace_id });
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct SetAnnouncementActive {
    pub active: bool,
}

pub async fn set_announcement_active(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Path(announcement_id): Path<i64>,
    Json(body): Json<SetAnnouncementActive>,
) -> Result<StatusCode, ApiError> {
    state
        .policy
        .ensure(&sec, Capability::AnnouncementWrite)
        .map_err(|e| e.into_api(sec.trace_id))?;

    let result = sqlx::query("UPDATE announcements SET active = $1, updated_at = NOW() WHERE id = $2")
        .bind(body.active)
        .bind(announcement_id)
        .execute(&state.db)
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?;
    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound { code: "announcement_not_found", trace_id: sec.trace_id });
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct SetAnnouncementPinned {
    pub pinned: bool,
}

pub async fn set_announcement_pinned(
    State(state): State<AppState>,
    SecurityCtxExtractor(sec): SecurityCtxExtractor,
    Path(announcement_id): Path<i64>,
    Json(body): Json<SetAnnouncementPinned>,
) -> Result<StatusCode, ApiError> {
    state
        .policy
        .ensure(&sec, Capability::AnnouncementWrite)
        .map_err(|e| e.into_api(sec.trace_id))?;

    let result = sqlx::query("UPDATE announcements SET pinned = $1, updated_at = NOW() WHERE id = $2")
        .bind(body.pinned)
        .bind(announcement_id)
        .execute(&state.db)
        .await
        .map_err(|e| ApiError::internal(e, sec.trace_id))?;
    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound { code: "announcement_not_found", trace_id: sec.trace_id });
    }
    Ok(StatusCode::NO_CONTENT)
}
