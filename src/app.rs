use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{Method, header},
    middleware::from_fn,
    routing::{get, post},
};
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::{
    handlers::{files, health, session},
    middleware_layer::no_cache::no_cache,
    state::AppState,
};

/// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: u64 = 1024 * 1024;

/// Builds the full HTTP surface around `state`.
///
/// Session creation is rate limited per peer IP when configured, which
/// requires serving with `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let config = state.config.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(86400));

    let mut creation_routes = Router::new()
        .route("/api/session", post(session::create_session))
        .route("/api/session/new", get(session::create_session_get));

    if let Some(limit) = config.create_rate_limit {
        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .per_second(limit.replenish_secs)
                .burst_size(limit.burst)
                .use_headers()
                .finish()
                .context("Invalid session creation rate limit")?,
        );
        creation_routes = creation_routes.layer(GovernorLayer::new(governor_conf));
        tracing::info!(
            "✅ Session creation limited to a burst of {} per IP",
            limit.burst
        );
    }

    let upload_routes = Router::new()
        .route("/api/upload", post(files::upload_file))
        .layer(DefaultBodyLimit::max(
            usize::try_from(config.max_file_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES))
                .unwrap_or(usize::MAX),
        ));

    let api_routes = Router::new()
        .route("/api/health", get(health::health))
        .route("/api/connect", post(session::connect))
        .route("/api/join", post(session::join))
        .route("/api/session/{id}/status", get(session::status))
        .route("/api/heartbeat", post(session::heartbeat))
        .route("/api/disconnect", post(session::disconnect))
        .route("/api/download/{id}", get(files::download_file))
        .route("/api/qr/{file}", get(session::qr_png))
        .merge(creation_routes)
        .merge(upload_routes)
        .layer(cors);

    let mut app = Router::new()
        .route("/join", get(session::join_redirect))
        .merge(api_routes);

    if config.serve_web {
        tracing::info!("✅ Serving web frontend from {}", config.public_dir.display());
        app = app
            .route_service("/sender", ServeFile::new(config.public_dir.join("sender.html")))
            .route_service(
                "/receiver",
                ServeFile::new(config.public_dir.join("receiver.html")),
            )
            .fallback_service(ServeDir::new(&config.public_dir));
    }

    Ok(app
        .layer(from_fn(no_cache))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false))
                .on_request(DefaultOnRequest::default().level(Level::DEBUG))
                .on_response(DefaultOnResponse::default().level(Level::DEBUG))
                .on_failure(DefaultOnFailure::default().level(Level::ERROR)),
        )
        .with_state(state))
}
