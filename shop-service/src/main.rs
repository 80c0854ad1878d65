use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use common_security::AdminPolicy;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tracing::warn;

use shop_service::integrity::spawn_integrity_sweeper;
use shop_service::{build_router, AppState, GatewayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let db = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .context("failed to run migrations")?;

    let policy = AdminPolicy::from_env();
    if policy.is_empty() {
        warn!("ADMIN_USERS is empty; every admin endpoint will deny");
    }

    let gateway = GatewayConfig {
        pay_base_url: env::var("GATEWAY_PAY_URL")
            .unwrap_or_else(|_| "https://pay.example.com/submit".to_string()),
        secret: env::var("GATEWAY_SECRET").context("GATEWAY_SECRET must be set")?,
        max_skew_secs: env::var("GATEWAY_MAX_SKEW_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300),
    };

    let state = AppState { db: db.clone(), policy: Arc::new(policy), gateway };
    spawn_integrity_sweeper(db);

    let app = build_router(state);

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8085);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));
    println!("starting shop-service on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
