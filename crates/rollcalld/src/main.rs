use anyhow::{Context, Result};
use rollcall_core::liveness::LivenessModel;
use rollcall_core::{DirectorySource, Models, OnnxDetector, OnnxEmbedder, OnnxLivenessModel, RecognitionService};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod store;

use config::Config;
use dbus_interface::AttendanceInterface;
use engine::CameraController;
use store::SqliteStore;

const BUS_NAME: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env().context("failed to load configuration")?;
    let store = Arc::new(SqliteStore::open(&config.db_path).context("failed to open attendance database")?);

    // Missing models leave the daemon up: sessions and listings still work
    // and status reports why recognition is off.
    let service = Arc::new(match load_models(&config) {
        Ok(models) => RecognitionService::init(models, &config.recognition, store.clone(), store.clone()),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "model load failed");
            RecognitionService::unavailable(format!("{e:#}"), store.clone(), store.clone())
        }
    });

    let source = DirectorySource::new(config.enrollment_dir.clone());
    match service.reload_enrollment(&source) {
        Ok(report) => {
            for failure in &report.failures {
                tracing::warn!(
                    identity = %failure.identity_id,
                    sample = ?failure.sample,
                    reason = %failure.reason,
                    "enrollment sample rejected"
                );
            }
            tracing::info!(
                enrolled = report.enrolled.len(),
                failures = report.failures.len(),
                "initial enrollment loaded"
            );
        }
        Err(e) => tracing::warn!(dir = %config.enrollment_dir.display(), error = %e, "initial enrollment skipped"),
    }

    let camera = Arc::new(CameraController::new(
        config.camera_device.clone(),
        config.warmup_frames,
        Arc::clone(&service),
    ));
    let iface = AttendanceInterface::new(Arc::clone(&service), Arc::clone(&camera), config.enrollment_dir.clone());

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(
        bus = if config.session_bus { "session" } else { "system" },
        name = BUS_NAME,
        device = %config.camera_device,
        "rollcalld ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    camera.stop().await;
    service.shutdown();

    Ok(())
}

fn load_models(config: &Config) -> Result<Models> {
    let detector_path = config.detector_model_path();
    let detector = OnnxDetector::load(&detector_path.to_string_lossy())
        .with_context(|| format!("detector model {}", detector_path.display()))?;

    let embedder_path = config.embedder_model_path();
    let embedder = OnnxEmbedder::load(&embedder_path.to_string_lossy())
        .with_context(|| format!("descriptor model {}", embedder_path.display()))?;

    Ok(Models {
        detector: Box::new(detector),
        embedder: Box::new(embedder),
        liveness_model: load_liveness_model(config),
    })
}

/// The learned liveness model is optional; without it the heuristic
/// checks carry the full weight.
fn load_liveness_model(config: &Config) -> Option<Box<dyn LivenessModel>> {
    if !config.recognition.liveness.enabled {
        return None;
    }
    let path = config.liveness_model_path();
    if !path.exists() {
        tracing::info!(path = %path.display(), "no liveness model; using heuristics only");
        return None;
    }
    match OnnxLivenessModel::load(&path.to_string_lossy()) {
        Ok(model) => Some(Box::new(model)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "liveness model failed to load; using heuristics only");
            None
        }
    }
}
