use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sendo::{app::build_router, config::Config, services::sweeper, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!("✅ Configuration loaded successfully");

    let state = AppState::new(config);
    tokio::fs::create_dir_all(state.blobs.root()).await?;

    let shutdown = CancellationToken::new();
    let sweeper = sweeper::spawn(state.clone(), shutdown.clone());

    let addr = state.config.bind_addr;
    let app = build_router(state)?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🚀 Server listening on http://{}", addr);
    tracing::info!("✅ All systems operational");

    let signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("🛑 Shutdown signal received"),
            _ = signal.cancelled() => {}
        }
    })
    .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    tracing::info!("👋 Server stopped");

    Ok(())
}
