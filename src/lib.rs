//! SensorWarden -- sensor-stream anomaly detection and alerting.
//!
//! This crate provides the core library for ingesting time-stamped sensor
//! readings, maintaining per-sensor rolling windows, scoring readings with
//! a trained sequence classifier, and emitting severity-tiered alerts.

pub mod api;
pub mod bus;
pub mod cache;
pub mod config;
pub mod detect;
pub mod features;
pub mod ingest;
pub mod model;
pub mod storage;
pub mod window;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use bus::BroadcastBus;
use cache::MemoryCache;
use config::Config;
use detect::engine::DetectionEngine;
use ingest::IngestService;
use model::ModelHandle;
use storage::Pool;
use window::WindowCache;

/// The assembled application: every component of the pipeline, wired.
pub struct App {
    pub config: Config,
    pub pool: Pool,
    pub bus: Arc<BroadcastBus>,
    pub windows: Arc<WindowCache>,
    pub models: Arc<ModelHandle>,
    pub engine: Arc<DetectionEngine>,
    pub ingest: Arc<IngestService>,
}

/// Wire the pipeline over an already-open pool. Does not touch the model
/// directory; call `App::load_model` to bring up inference.
pub fn build(config: Config, pool: Pool) -> App {
    let bus = Arc::new(BroadcastBus::default());
    let cache = Arc::new(MemoryCache::new());
    let windows = Arc::new(WindowCache::new(
        pool.clone(),
        cache,
        config.window.horizon_hours,
        config.cache_ttl(),
        config.store_timeout(),
    ));
    let models = Arc::new(ModelHandle::new());
    let engine = Arc::new(DetectionEngine::new(
        pool.clone(),
        windows.clone(),
        models.clone(),
        bus.clone(),
        &config,
    ));
    let ingest = Arc::new(IngestService::new(
        windows.clone(),
        engine.clone(),
        bus.clone(),
    ));

    App {
        config,
        pool,
        bus,
        windows,
        models,
        engine,
        ingest,
    }
}

impl App {
    /// Load model artifacts from the configured directory. Missing or
    /// mismatched artifacts leave the engine serving without a model
    /// (ingest keeps working, scoring reports health-degraded).
    pub fn load_model(&self) {
        let dir = self.config.model.model_dir.clone();
        match self.models.reload_from(Path::new(&dir)) {
            Ok(()) => {
                tracing::info!(model_dir = %dir, "model loaded");
            }
            Err(e) => {
                tracing::warn!(
                    model_dir = %dir,
                    error = %e,
                    "no usable model artifacts; scoring degraded until a training run completes"
                );
            }
        }
    }
}

/// Start the SensorWarden daemon: API server plus the detection pipeline.
pub async fn serve(bind: &str, config: Config) -> Result<()> {
    tracing::info!(db_path = %config.storage.db_path, "Initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;

    let app = build(config, pool);
    app.load_model();

    let state = api::state::AppState {
        pool: app.pool.clone(),
        engine: app.engine.clone(),
        ingest: app.ingest.clone(),
    };
    let router = api::router(state);

    let addr: std::net::SocketAddr = bind.parse()?;
    tracing::info!(%addr, "SensorWarden listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
