use crate::{app::App, auth, bridge};
use anyhow::{Context, Result};
use axum::{
    Router, middleware,
    routing::{get, post},
};
use owo_colors::OwoColorize;
use parley_common::{access_log, cors};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

pub fn router(app: App) -> Router {
    let health_router = Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(health));
    let auth_router = Router::new()
        .route("/auth/status", get(auth::status))
        .route("/auth/start", post(auth::start))
        .route("/auth/phone", post(auth::phone))
        .route("/auth/code", post(auth::code))
        .route("/auth/password", post(auth::password))
        .layer(middleware::from_fn(access_log::public))
        .with_state(app.clone());
    let ws_router = Router::new()
        .route("/", get(bridge::upgrade))
        .route("/ws", get(bridge::upgrade))
        .layer(middleware::from_fn(access_log::public))
        .with_state(app);
    auth_router
        .merge(ws_router)
        .layer(cors::dev())
        .merge(health_router)
}

pub async fn run(cancel: CancellationToken, port: u16, app: App) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port)
        .parse()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    println!(
        "{}{}",
        "🚀 Starting gateway server • port=".green(),
        format!("{}", port).green().dimmed()
    );
    let start = std::time::Instant::now();
    axum::serve(listener, router(app))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Failed to serve gateway router")?;
    println!(
        "{} {} {} {} {}",
        "🛑 Server on port".red(),
        format!("{}", port).red().dimmed(),
        "shut down gracefully".red(),
        "• uptime was".red(),
        humantime::format_duration(std::time::Duration::from_secs(start.elapsed().as_secs()))
            .red()
            .dimmed()
    );
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}
