use std::sync::Arc;

use anyhow::{Context, Result};
use rollcall_core::{
    EnrollmentService, FaceEncoder, IdentityStore, LazyEncoder, MatchingEngine, OnnxEncoder,
    PhotoArea, SessionLedger,
};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
#[cfg(test)]
mod test_support;

use config::{Bus, Config};
use dbus_interface::{AttendanceService, ModelProbe, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        model_dir = %config.model_dir.display(),
        threshold = config.similarity_threshold,
        "rollcalld starting"
    );

    let store = Arc::new(
        IdentityStore::open(config.registry_path(), PhotoArea::new(config.images_dir()))
            .context("failed to open identity registry")?,
    );
    let ledger = Arc::new(
        SessionLedger::open(config.sessions_path(), config.course_defaults())
            .context("failed to open session ledger")?,
    );

    let model_dir = config.model_dir.clone();
    let lazy = Arc::new(LazyEncoder::new(move || OnnxEncoder::load(&model_dir)));
    if config.preload_models {
        lazy.load().context("failed to preload face models")?;
    }
    let probe = lazy.clone();
    let models_loaded: ModelProbe = Arc::new(move || probe.is_loaded());
    let encoder: Arc<dyn FaceEncoder> = lazy;

    let enrollment = Arc::new(EnrollmentService::new(
        encoder.clone(),
        store.clone(),
        config.enrollment_policy(),
    ));
    let matching = Arc::new(
        MatchingEngine::new(encoder, store.clone())
            .with_threshold(config.similarity_threshold)
            .with_max_upload_bytes(config.max_upload_bytes),
    );
    let engine = engine::spawn_engine(enrollment, matching, config.workers, config.queue_depth)?;

    let service = AttendanceService::new(
        engine,
        store,
        ledger,
        models_loaded,
        config.request_timeout(),
        config.max_upload_bytes,
    );

    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to claim {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
