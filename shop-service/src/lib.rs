pub mod app;
pub mod fulfillment;
pub mod integrity;
pub mod metrics;
pub mod signature;

pub mod announcement_handlers;
pub mod callback_handlers;
pub mod card_handlers;
pub mod order_handlers;
pub mod product_handlers;
pub mod settings_handlers;

pub use app::{build_router, AppState, GatewayConfig};
pub use common_http_errors::ApiError;
