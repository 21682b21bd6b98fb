//! Image Insight Service
//!
//! Captions, face gender and document OCR over uploaded images, served over REST (Axum).
//! Face and OCR models run locally on OpenVINO; captions come from a hosted BLIP endpoint.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use image_insight::api::{create_rest_router, AppState};
use image_insight::config::Config;
use image_insight::engine::{Dictionary, ModelPool, OcrEngine, RemoteCaptioner};
use image_insight::service::{Backends, InsightService, OpenVinoFaceAnalyzer, OpenVinoTextReader};
use image_insight::storage::SqliteStorage;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Starting Image Insight Service v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = Config::default_path();
    let config = Config::load_or_default(&config_path)?;

    info!("Configuration loaded:");
    info!("  Listen: {}:{}", config.server.host, config.server.port);
    info!("  Device: {}", config.inference.device);
    info!("  Model idle timeout: {}s", config.inference.model_idle_timeout);
    info!("  Caption model: {} via {}", config.caption.model, config.caption.endpoint);
    if config.caption.api_token.is_none() {
        warn!("No caption API token set; hosted endpoints may reject requests");
    }

    // Initialize model pool
    let pool = Arc::new(ModelPool::new(&config.inference, &config.models));
    for (model, loaded) in pool.get_status() {
        info!("  Model {}: {}", model.as_str(), if loaded { "loaded" } else { "lazy" });
    }

    // Start model cleanup task
    tokio::spawn(pool.clone().start_cleanup_task());

    // Backends
    let dictionary = Dictionary::load(&config.models.text_dictionary).unwrap_or_else(|e| {
        error!("OCR will fail until the dictionary is available: {:#}", e);
        Dictionary::parse("")
    });
    let backends = Backends {
        captioner: Arc::new(RemoteCaptioner::new(&config.caption)?),
        faces: Arc::new(OpenVinoFaceAnalyzer::new(pool.clone(), &config.face)),
        text: Arc::new(OpenVinoTextReader::new(
            pool.clone(),
            OcrEngine::new(pool.clone(), dictionary, &config.ocr),
        )),
    };

    // Initialize storage
    let sqlite_path = config.storage.sqlite_path.to_string_lossy().into_owned();
    let storage = Arc::new(SqliteStorage::new(&sqlite_path, config.storage.data_dir.clone()).await?);
    info!("SQLite storage initialized at: {}", sqlite_path);

    let service = Arc::new(InsightService::new(backends, storage, config.storage.clone()));
    let app_state = Arc::new(AppState::new(service));
    let router = create_rest_router(app_state, config.server.body_limit_mb, &config.storage.data_dir);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("REST API listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received, cleaning up...");
        })
        .await?;

    // Shutdown model pool
    pool.shutdown();

    info!("Goodbye!");
    Ok(())
}
