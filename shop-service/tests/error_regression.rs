use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use common_http_errors::ApiError;
use tower::ServiceExt; // for oneshot

#[tokio::test]
async fn internal_error_500() {
    async fn boom() -> Result<String, ApiError> {
        Err(ApiError::Internal { trace_id: None, message: Some("synthetic".into()) })
    }
    let app = Router::new().route("/boom", get(boom));
    let req = Request::builder().uri("/boom").method("GET").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "internal_error");
}

#[tokio::test]
async fn conflict_carries_code_and_message() {
    async fn clash() -> Result<String, ApiError> {
        Err(ApiError::Conflict {
            code: "not_refundable",
            trace_id: None,
            message: Some("order in status pending cannot be refunded".into()),
        })
    }
    let app = Router::new().route("/clash", get(clash));
    let req = Request::builder().uri("/clash").method("GET").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "not_refundable");
    let bytes = to_bytes(resp.into_body(), 1024 * 64).await.unwrap();
    let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v["code"], "not_refundable");
    assert_eq!(v["message"], "order in status pending cannot be refunded");
}

#[tokio::test]
async fn forbidden_names_missing_capability() {
    async fn denied() -> Result<String, ApiError> {
        Err(ApiError::ForbiddenMissingCapability { capability: "order_refund", trace_id: None })
    }
    let app = Router::new().route("/denied", get(denied));
    let req = Request::builder().uri("/denied").method("GET").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "missing_capability");
    let bytes = to_bytes(resp.into_body(), 1024 * 64).await.unwrap();
    let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v["missing_capability"], "order_refund");
}

#[tokio::test]
async fn unauthorized_surfaces_specific_code() {
    async fn reject() -> Result<String, ApiError> {
        Err(ApiError::Unauthorized { code: "sig_mismatch", trace_id: None })
    }
    let app = Router::new().route("/reject", get(reject));
    let req = Request::builder().uri("/reject").method("GET").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "sig_mismatch");
}

#[tokio::test]
async fn not_found_omits_empty_fields() {
    async fn missing() -> Result<String, ApiError> {
        Err(ApiError::NotFound { code: "order_not_found", trace_id: None })
    }
    let app = Router::new().route("/missing", get(missing));
    let req = Request::builder().uri("/missing").method("GET").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let bytes = to_bytes(resp.into_body(), 1024 * 64).await.unwrap();
    let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v["code"], "order_not_found");
    assert!(v.get("message").is_none());
    assert!(v.get("missing_capability").is_none());
}
