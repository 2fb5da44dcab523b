//! HTTP front-end.
//!
//! Thin layer over the streaming core: it validates share-relative paths and
//! range headers, hands them to the session machinery, and maps results to
//! HTTP responses. The capability matrix, prober, encoder manager, and
//! session registry are constructed once here and passed down explicitly.

pub mod routes_sessions;
pub mod routes_video;

use crate::config::Config;
use crate::encoder::EncoderManager;
use crate::events::EventBus;
use crate::probe::MediaProber;
use crate::streaming::SessionRegistry;
use crate::tools;
use anyhow::{Context, Result};
use axum::{
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Shared application context
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub prober: Arc<MediaProber>,
    pub encoder: Arc<EncoderManager>,
    pub registry: Arc<SessionRegistry>,
    pub events: EventBus,
}

impl AppContext {
    /// Build every long-lived component from configuration.
    pub fn from_config(config: Config) -> Self {
        let events = EventBus::new();
        let prober = MediaProber::new(
            tools::resolve_tool("ffprobe", config.tools.ffprobe_path.as_deref()),
            Duration::from_secs(config.streaming.probe_timeout_secs),
        );
        let encoder = EncoderManager::new(
            tools::resolve_tool("ffmpeg", config.tools.ffmpeg_path.as_deref()),
            Duration::from_secs(config.streaming.cancel_grace_secs),
        );
        let registry = SessionRegistry::new(config.streaming.max_sessions, events.clone());

        Self {
            config: Arc::new(config),
            prober: Arc::new(prober),
            encoder: Arc::new(encoder),
            registry: Arc::new(registry),
            events,
        }
    }
}

/// Create the Axum router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::RANGE]);

    Router::new()
        .route("/health", get(health_check))
        .nest("/video", routes_video::video_routes())
        .nest("/api", routes_sessions::session_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Start the HTTP server
pub async fn start_server(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let ctx = AppContext::from_config(config);
    let app = create_router(ctx);

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
