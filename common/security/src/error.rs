use common_http_errors::ApiError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("request carries no user identity")]
    Unauthenticated,
    #[error("user lacks the {capability} capability")]
    Forbidden { capability: &'static str },
}

impl SecurityError {
    pub fn into_api(self, trace_id: Option<Uuid>) -> ApiError {
        match self {
            SecurityError::Unauthenticated => ApiError::Unauthorized { code: "unauthorized", trace_id },
            SecurityError::Forbidden { capability } => {
                ApiError::ForbiddenMissingCapability { capability, trace_id }
            }
        }
    }
}
