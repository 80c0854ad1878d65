use std::convert::Infallible;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{request::Parts, HeaderMap};
use serde::{Deserialize, Serialize};
use tracing::Span;
use uuid::Uuid;

use crate::error::SecurityError;

/// Identity facts forwarded by the edge after the external provider has
/// authenticated the user. This service never sees credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub username: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityContext {
    pub user: Option<UserIdentity>,
    pub trace_id: Option<Uuid>,
}

impl SecurityContext {
    pub fn anonymous() -> Self {
        Self { user: None, trace_id: None }
    }

    /// The buyer identity, or Unauthenticated for anonymous requests.
    pub fn require_user(&self) -> Result<&UserIdentity, SecurityError> {
        self.user.as_ref().ok_or(SecurityError::Unauthenticated)
    }
}

pub struct SecurityCtxExtractor(pub SecurityContext);

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn user_from_headers(headers: &HeaderMap) -> Option<UserIdentity> {
    let username = header_str(headers, "X-Shop-User")?.to_string();
    let email = header_str(headers, "X-Shop-Email").map(str::to_string);
    Some(UserIdentity { username, email })
}

fn trace_id_from_headers(headers: &HeaderMap) -> Option<Uuid> {
    header_str(headers, "X-Trace-ID").and_then(|s| Uuid::parse_str(s).ok())
}

#[async_trait]
impl<S> FromRequestParts<S> for SecurityCtxExtractor where S: Send + Sync {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let user = user_from_headers(headers);
        let trace_id = trace_id_from_headers(headers).or_else(|| Some(Uuid::new_v4()));

        if let Some(u) = user.as_ref() {
            Span::current().record("actor", tracing::field::display(&u.username));
        }
        if let Some(tid) = trace_id.as_ref() {
            Span::current().record("trace_id", tracing::field::display(tid));
        }

        Ok(SecurityCtxExtractor(SecurityContext { user, trace_id }))
    }
}
