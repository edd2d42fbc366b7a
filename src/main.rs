//! detstream - Live Video Detection Server
//!
//! Main entry point for the detstream server.

use detstream::{
    detector::{Detector, HttpDetector},
    state::{AppConfig, AppState},
    stream_source::FfmpegOpener,
    web_api,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "detstream=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting detstream v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        detector_url = %config.detector_url,
        frame_quality = config.frame_quality,
        max_frame_width = config.max_frame_width,
        alert_enabled = config.alert_enabled,
        alert_confidence_threshold = config.alert_confidence_threshold,
        stream_timeout_secs = config.stream_timeout_secs,
        "Configuration loaded"
    );

    // Detector client
    let detector = Arc::new(HttpDetector::new(
        config.detector_url.clone(),
        config.confidence_threshold,
        config.detector_timeout(),
    )?);
    if detector.health_check().await {
        tracing::info!(detector_url = %detector.base_url(), "Detector reachable");
    } else {
        tracing::warn!(
            detector_url = %detector.base_url(),
            "Detector not reachable; sessions will fail until it is up"
        );
    }

    // Capture backend (ffmpeg subprocess per stream)
    let opener = Arc::new(FfmpegOpener::new(config.stream_config().read_timeout));

    let state = AppState::new(config, detector, opener);

    let app = web_api::create_router(state.clone())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Pipelines first, then subscribers so open sockets can finish
            shutdown_state.service.shutdown().await;
            shutdown_state.hub.close_all().await;
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
