use rollcall_core::{FrameOutcome, RecognitionService, ServiceError};
use rollcall_hw::{Camera, CameraError, Frame, FrameStream};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::oneshot;

/// Capture errors in a row after which the loop gives up on the device.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("capture thread exited before the camera was ready")]
    ChannelClosed,
}

/// Anything that yields camera frames one at a time.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

impl FrameSource for FrameStream<'_> {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        FrameStream::next_frame(self)
    }
}

/// Counters shared between the capture thread and status queries.
#[derive(Default)]
pub struct CaptureStats {
    frames_processed: AtomicU64,
    dark_skipped: AtomicU64,
    capture_errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl CaptureStats {
    fn set_error(&self, error: impl ToString) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    }

    fn reset(&self) {
        self.frames_processed.store(0, Ordering::Relaxed);
        self.dark_skipped.store(0, Ordering::Relaxed);
        self.capture_errors.store(0, Ordering::Relaxed);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraStatus {
    pub running: bool,
    pub device: String,
    pub frames_processed: u64,
    pub dark_frames_skipped: u64,
    pub capture_errors: u64,
    pub last_error: Option<String>,
}

/// Pull frames from `source` into the service until `stop` is set.
///
/// Dark frames are skipped. Returns an error once the source fails
/// `MAX_CONSECUTIVE_ERRORS` times in a row; returns `Ok` when stopped or
/// when the service has shut down.
pub fn run_capture_loop(
    source: &mut dyn FrameSource,
    service: &RecognitionService,
    stop: &AtomicBool,
    stats: &CaptureStats,
) -> Result<(), CameraError> {
    let mut consecutive_errors = 0u32;

    while !stop.load(Ordering::SeqCst) {
        let frame = match source.next_frame() {
            Ok(frame) => {
                consecutive_errors = 0;
                frame
            }
            Err(e) => {
                consecutive_errors += 1;
                stats.capture_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, consecutive_errors, "frame capture failed");
                stats.set_error(&e);
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    return Err(e);
                }
                continue;
            }
        };

        if frame.is_dark {
            stats.dark_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(seq = frame.sequence, "skipping dark frame");
            continue;
        }

        match service.process_frame(&frame.image) {
            Ok(FrameOutcome::Processed { report, newly_recorded }) => {
                stats.frames_processed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    seq = frame.sequence,
                    faces = report.faces.len(),
                    confirmed = report.confirmed.len(),
                    new = newly_recorded.len(),
                    "frame processed"
                );
            }
            Ok(FrameOutcome::Idle) => {}
            Ok(FrameOutcome::Unavailable { reason }) => {
                tracing::trace!(%reason, "recognition unavailable; frame dropped");
            }
            Err(ServiceError::ShutDown) => {
                tracing::info!("recognition service shut down; leaving capture loop");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "frame processing failed");
                stats.set_error(&e);
            }
        }
    }

    Ok(())
}

struct CaptureHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Starts and stops the capture thread for one camera device.
pub struct CameraController {
    device: String,
    warmup_frames: usize,
    service: Arc<RecognitionService>,
    stats: Arc<CaptureStats>,
    running: Mutex<Option<CaptureHandle>>,
}

impl CameraController {
    pub fn new(device: impl Into<String>, warmup_frames: usize, service: Arc<RecognitionService>) -> Self {
        Self {
            device: device.into(),
            warmup_frames,
            service,
            stats: Arc::new(CaptureStats::default()),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<CaptureHandle>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running().as_ref().is_some_and(|h| !h.thread.is_finished())
    }

    /// Open the camera on a dedicated thread and start feeding frames to the
    /// service. Resolves once the device is open and warmed up. Returns
    /// `false` if capture was already running.
    pub async fn start(&self) -> Result<bool, EngineError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut running = self.running();
            if running.as_ref().is_some_and(|h| !h.thread.is_finished()) {
                return Ok(false);
            }

            self.stats.reset();
            let stop = Arc::new(AtomicBool::new(false));
            let device = self.device.clone();
            let warmup_frames = self.warmup_frames;
            let service = Arc::clone(&self.service);
            let stats = Arc::clone(&self.stats);
            let thread_stop = Arc::clone(&stop);

            let thread = std::thread::Builder::new()
                .name("rollcall-capture".into())
                .spawn(move || {
                    capture_thread(&device, warmup_frames, &service, &thread_stop, &stats, ready_tx)
                })
                .map_err(EngineError::Spawn)?;

            *running = Some(CaptureHandle { stop, thread });
        }

        match ready_rx.await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                self.running().take();
                Err(e.into())
            }
            Err(_) => Err(EngineError::ChannelClosed),
        }
    }

    /// Signal the capture thread to stop and wait for it. Returns `false` if
    /// nothing was running.
    pub async fn stop(&self) -> bool {
        let Some(handle) = self.running().take() else {
            return false;
        };
        handle.stop.store(true, Ordering::SeqCst);

        let (done_tx, done_rx) = oneshot::channel();
        std::thread::spawn(move || {
            if handle.thread.join().is_err() {
                tracing::error!("capture thread panicked");
            }
            let _ = done_tx.send(());
        });
        let _ = done_rx.await;
        tracing::info!(device = %self.device, "camera stopped");
        true
    }

    pub fn status(&self) -> CameraStatus {
        CameraStatus {
            running: self.is_running(),
            device: self.device.clone(),
            frames_processed: self.stats.frames_processed.load(Ordering::Relaxed),
            dark_frames_skipped: self.stats.dark_skipped.load(Ordering::Relaxed),
            capture_errors: self.stats.capture_errors.load(Ordering::Relaxed),
            last_error: self
                .stats
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

fn capture_thread(
    device: &str,
    warmup_frames: usize,
    service: &RecognitionService,
    stop: &AtomicBool,
    stats: &CaptureStats,
    ready: oneshot::Sender<Result<(), CameraError>>,
) {
    let camera = match Camera::open(device) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut stream = match camera.stream() {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if warmup_frames > 0 {
        tracing::info!(count = warmup_frames, "discarding warmup frames");
        for _ in 0..warmup_frames {
            let _ = stream.next_frame();
        }
    }

    tracing::info!(
        device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "capture started"
    );
    let _ = ready.send(Ok(()));

    if let Err(e) = run_capture_loop(&mut stream, service, stop, stats) {
        tracing::error!(device, error = %e, "capture loop aborted");
        stats.set_error(&e);
    }
    tracing::info!(device, "capture thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rollcall_core::policy::PolicyError;
    use rollcall_core::session::SessionMetadata;
    use rollcall_core::detector::DetectorError;
    use rollcall_core::recognizer::RecognizerError;
    use rollcall_core::{
        AttendancePolicy, AttendanceRecord, AttendanceSink, BoundingBox, FaceDetector, FaceEmbedder, Models,
        PolicySource, RecognitionConfig, RecordOutcome, SinkError,
    };
    use std::collections::VecDeque;
    use std::time::Instant;

    struct NullStore;

    impl AttendanceSink for NullStore {
        fn record(&self, _: &AttendanceRecord) -> Result<RecordOutcome, SinkError> {
            Ok(RecordOutcome::Inserted)
        }
    }

    impl PolicySource for NullStore {
        fn policy_for(&self, _: &str) -> Result<Option<AttendancePolicy>, PolicyError> {
            Ok(None)
        }
    }

    /// Replays scripted frames, then raises `stop`.
    struct ScriptedSource<'a> {
        frames: VecDeque<Result<Frame, CameraError>>,
        stop: &'a AtomicBool,
    }

    impl FrameSource for ScriptedSource<'_> {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            let next = self.frames.pop_front();
            if self.frames.is_empty() {
                self.stop.store(true, Ordering::SeqCst);
            }
            next.unwrap_or_else(|| Err(CameraError::CaptureFailed("exhausted".into())))
        }
    }

    fn frame(seq: u32, is_dark: bool) -> Result<Frame, CameraError> {
        Ok(Frame {
            image: RgbImage::from_pixel(64, 48, Rgb([90, 90, 90])),
            timestamp: Instant::now(),
            sequence: seq,
            is_dark,
        })
    }

    struct NoFaces;

    impl FaceDetector for NoFaces {
        fn detect(&mut self, _: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(Vec::new())
        }
    }

    struct ConstantEmbedder;

    impl FaceEmbedder for ConstantEmbedder {
        fn embed(&mut self, _: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
            Ok(vec![1.0; 8])
        }
    }

    fn ready_service() -> RecognitionService {
        let models = Models { detector: Box::new(NoFaces), embedder: Box::new(ConstantEmbedder), liveness_model: None };
        RecognitionService::init(models, &RecognitionConfig::default(), Arc::new(NullStore), Arc::new(NullStore))
    }

    fn service() -> RecognitionService {
        RecognitionService::unavailable("no models in tests", Arc::new(NullStore), Arc::new(NullStore))
    }

    #[test]
    fn test_loop_skips_dark_frames_and_counts_errors() {
        let service = service();
        let stop = AtomicBool::new(false);
        let stats = CaptureStats::default();
        let mut source = ScriptedSource {
            frames: VecDeque::from(vec![
                frame(0, true),
                Err(CameraError::CaptureFailed("glitch".into())),
                frame(1, false),
                frame(2, true),
            ]),
            stop: &stop,
        };

        run_capture_loop(&mut source, &service, &stop, &stats).unwrap();
        assert_eq!(stats.dark_skipped.load(Ordering::Relaxed), 2);
        assert_eq!(stats.capture_errors.load(Ordering::Relaxed), 1);
        // Scanning is off, so the bright frame is not counted as processed.
        assert_eq!(stats.frames_processed.load(Ordering::Relaxed), 0);
        assert!(stats.last_error.lock().unwrap().as_deref().unwrap().contains("glitch"));
    }

    #[test]
    fn test_loop_gives_up_after_repeated_errors() {
        let service = service();
        let stop = AtomicBool::new(false);
        let stats = CaptureStats::default();
        let mut frames: VecDeque<_> = (0..MAX_CONSECUTIVE_ERRORS)
            .map(|_| Err(CameraError::CaptureFailed("unplugged".into())))
            .collect();
        frames.push_back(frame(0, false));
        let mut source = ScriptedSource { frames, stop: &stop };

        assert!(run_capture_loop(&mut source, &service, &stop, &stats).is_err());
        assert_eq!(stats.capture_errors.load(Ordering::Relaxed), u64::from(MAX_CONSECUTIVE_ERRORS));
    }

    #[test]
    fn test_loop_feeds_scanning_service() {
        let service = ready_service();
        service.start_session(SessionMetadata { class_id: "CS101".into(), ..Default::default() }).unwrap();
        let stop = AtomicBool::new(false);
        let stats = CaptureStats::default();
        let mut source = ScriptedSource {
            frames: VecDeque::from(vec![frame(0, false), frame(1, true), frame(2, false)]),
            stop: &stop,
        };

        run_capture_loop(&mut source, &service, &stop, &stats).unwrap();
        assert_eq!(stats.frames_processed.load(Ordering::Relaxed), 2);
        assert_eq!(stats.dark_skipped.load(Ordering::Relaxed), 1);
        assert!(service.session_snapshot().entries.is_empty());
    }

    #[test]
    fn test_stopped_flag_prevents_capture() {
        let service = service();
        let stop = AtomicBool::new(true);
        let stats = CaptureStats::default();
        let mut source = ScriptedSource { frames: VecDeque::from(vec![frame(0, false)]), stop: &stop };

        run_capture_loop(&mut source, &service, &stop, &stats).unwrap();
        assert_eq!(source.frames.len(), 1);
    }

    #[tokio::test]
    async fn test_controller_start_missing_device() {
        let controller = CameraController::new("/dev/video-does-not-exist", 0, Arc::new(service()));
        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, EngineError::Camera(CameraError::DeviceNotFound(_))));
        assert!(!controller.is_running());
        assert!(!controller.stop().await);

        let status = controller.status();
        assert!(!status.running);
        assert_eq!(status.device, "/dev/video-does-not-exist");
    }
}
