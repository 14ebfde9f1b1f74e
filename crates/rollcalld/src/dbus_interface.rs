use crate::engine::CameraController;
use rollcall_core::session::SessionMetadata;
use rollcall_core::{DirectorySource, RecognitionService};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use zbus::{fdo, interface};

/// D-Bus control surface of the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Every method answers with a JSON document.
pub struct AttendanceInterface {
    service: Arc<RecognitionService>,
    camera: Arc<CameraController>,
    enrollment_dir: PathBuf,
}

impl AttendanceInterface {
    pub fn new(service: Arc<RecognitionService>, camera: Arc<CameraController>, enrollment_dir: PathBuf) -> Self {
        Self { service, camera, enrollment_dir }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceInterface {
    /// Open an attendance session for a class meeting and start recognising.
    /// The camera must already be running.
    async fn start_scanning(&self, metadata_json: &str) -> fdo::Result<String> {
        let metadata: SessionMetadata = serde_json::from_str(metadata_json)
            .map_err(|e| fdo::Error::InvalidArgs(format!("invalid session metadata: {e}")))?;
        if metadata.class_id.is_empty() {
            return Err(fdo::Error::InvalidArgs("class_id is required".into()));
        }
        if !self.camera.is_running() {
            return Err(fdo::Error::Failed("camera is not running; start it first".into()));
        }

        tracing::info!(class = %metadata.class_id, slot = ?metadata.timetable_slot_id, "start_scanning requested");
        let session_id = self.service.start_session(metadata).map_err(failed)?;
        Ok(serde_json::json!({ "session_id": session_id, "scanning": true }).to_string())
    }

    /// Stop recognising and close the session. Returns its final state.
    async fn stop_scanning(&self) -> fdo::Result<String> {
        tracing::info!("stop_scanning requested");
        to_json(&self.service.stop_session())
    }

    /// Current session state.
    async fn session(&self) -> fdo::Result<String> {
        to_json(&self.service.session_snapshot())
    }

    /// Rebuild the enrolled table from the enrollment directory.
    async fn reload_faces(&self) -> fdo::Result<String> {
        let service = Arc::clone(&self.service);
        let source = DirectorySource::new(self.enrollment_dir.clone());
        tracing::info!(dir = %self.enrollment_dir.display(), "reload_faces requested");

        let report = run_blocking(move || service.reload_enrollment(&source)).await?.map_err(failed)?;
        to_json(&report)
    }

    async fn list_faces(&self) -> fdo::Result<String> {
        to_json(&self.service.enrolled_identities())
    }

    /// Daemon status: recognition service and camera.
    async fn status(&self) -> fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "service": self.service.status(),
            "camera": self.camera.status(),
        })
        .to_string())
    }

    async fn start_camera(&self) -> fdo::Result<String> {
        tracing::info!("start_camera requested");
        let started = self.camera.start().await.map_err(failed)?;
        Ok(serde_json::json!({ "started": started, "camera": self.camera.status() }).to_string())
    }

    async fn stop_camera(&self) -> fdo::Result<String> {
        tracing::info!("stop_camera requested");
        let stopped = self.camera.stop().await;
        Ok(serde_json::json!({ "stopped": stopped, "camera": self.camera.status() }).to_string())
    }

    async fn camera_status(&self) -> fdo::Result<String> {
        to_json(&self.camera.status())
    }
}

fn failed(e: impl std::fmt::Display) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

fn to_json(value: &impl serde::Serialize) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

/// Run `f` on its own thread so long work does not stall the bus.
async fn run_blocking<T, F>(f: F) -> fdo::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("rollcall-blocking".into())
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(failed)?;
    rx.await.map_err(|_| fdo::Error::Failed("worker thread exited".into()))
}
