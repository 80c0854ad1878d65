use std::sync::Arc;

use axum::extract::State;
use axum::http::{header::{ACCEPT, CONTENT_TYPE}, HeaderName, HeaderValue, Method, StatusCode};
use axum::{middleware, routing::{delete, get, post}, Router};
use sqlx::PgPool;
use tower_http::cors::{AllowOrigin, CorsLayer};

use common_security::AdminPolicy;

use crate::announcement_handlers::{
    create_announcement, delete_announcement, list_announcements, set_announcement_active,
    set_announcement_pinned,
};
use crate::callback_handlers::payment_callback;
use crate::card_handlers::{delete_card, import_cards, list_cards};
use crate::metrics::{self, HTTP_ERRORS_TOTAL};
use crate::order_handlers::{
    admin_list_orders, create_order, get_order, list_my_orders, redeliver_order, refund_order,
};
use crate::product_handlers::{
    delete_product, get_product, list_products, set_product_active, set_product_sort,
    upsert_product,
};
use crate::settings_handlers::{get_settings, save_settings};

pub async fn http_error_metrics(req: axum::http::Request<axum::body::Body>, next: axum::middleware::Next) -> axum::response::Response {
    let resp = next.run(req).await;
    let status = resp.status();
    if status.as_u16() >= 400 {
        let code = resp.headers().get("X-Error-Code").and_then(|v| v.to_str().ok()).unwrap_or("unknown");
        HTTP_ERRORS_TOTAL.with_label_values(&["shop-service", code, status.as_str()]).inc();
    }
    resp
}

pub async fn health() -> &'static str { "ok" }

#[derive(Clone)]
pub struct GatewayConfig {
    pub pay_base_url: String,
    pub secret: String,
    pub max_skew_secs: i64,
}

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub policy: Arc<AdminPolicy>,
    pub gateway: GatewayConfig,
}

pub fn build_router(state: AppState) -> Router {
    let allowed_origins = [
        "http://localhost:3000",
        "http://localhost:3001",
        "http://localhost:5173",
    ];
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            allowed_origins.iter().filter_map(|o| o.parse::<HeaderValue>().ok()).collect::<Vec<_>>(),
        ))
        .allow_methods([
            Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS,
        ])
        .allow_headers([
            ACCEPT, CONTENT_TYPE,
            HeaderName::from_static("x-shop-user"),
            HeaderName::from_static("x-shop-email"),
            HeaderName::from_static("x-trace-id"),
        ]);

    async fn metrics_endpoint(State(_state): State<AppState>) -> (StatusCode, String) {
        (StatusCode::OK, metrics::gather())
    }

    Router::new()
        .route("/healthz", get(health))
        .route("/products", get(list_products))
        .route("/products/:product_id", get(get_product))
        .route("/orders", post(create_order).get(list_my_orders))
        .route("/orders/:order_id", get(get_order))
        .route("/callbacks/payment", get(payment_callback))
        .route("/announcements", get(list_announcements))
        .route("/settings", get(get_settings))
        .route("/admin/products", post(upsert_product))
        .route("/admin/products/:product_id", delete(delete_product))
        .route("/admin/products/:product_id/active", post(set_product_active))
        .route("/admin/products/:product_id/reorder", post(set_product_sort))
        .route("/admin/cards", get(list_cards).post(import_cards))
        .route("/admin/cards/:card_id", delete(delete_card))
        .route("/admin/orders", get(admin_list_orders))
        .route("/admin/orders/:order_id/refund", post(refund_order))
        .route("/admin/orders/:order_id/redeliver", post(redeliver_order))
        .route("/admin/settings", post(save_settings))
        .route("/admin/announcements", post(create_announcement))
        .route("/admin/announcements/:announcement_id", delete(delete_announcement))
        .route("/admin/announcements/:announcement_id/active", post(set_announcement_active))
        .route("/admin/announcements/:announcement_id/pin", post(set_announcement_pinned))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(cors)
        .layer(middleware::from_fn(http_error_metrics))
}
