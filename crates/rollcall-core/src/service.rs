//! `RecognitionService`: the one object that owns the models, the enrolled
//! table, the tracker and the live session.
//!
//! Built once at process start and shared by handle. Frame processing and
//! control calls may come from different threads; the engine, the session
//! and the enrollment table each sit behind their own lock.

use crate::config::RecognitionConfig;
use crate::detector::FaceDetector;
use crate::enrollment::{self, EnrolledSummary, EnrollmentError, EnrollmentStore, LoadReport};
use crate::liveness::LivenessModel;
use crate::pipeline::{ConfirmedIdentity, FrameProcessor, FrameReport, PipelineError};
use crate::policy::{resolve_status, PolicySource};
use crate::recognizer::{FaceEmbedder, Recognizer};
use crate::session::{Admission, AttendanceSession, AttendanceSessionState, SessionMetadata};
use crate::sink::{AttendanceRecord, AttendanceSink, RecordOutcome};
use crate::source::{EnrollmentSource, SourceError};
use chrono::Utc;
use image::RgbImage;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("recognition unavailable: {0}")]
    Unavailable(String),
    #[error("recognition service has shut down")]
    ShutDown,
    #[error("enrollment source: {0}")]
    Source(#[from] SourceError),
    #[error("pipeline: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Capability providers handed to [`RecognitionService::init`].
pub struct Models {
    pub detector: Box<dyn FaceDetector>,
    pub embedder: Box<dyn FaceEmbedder>,
    pub liveness_model: Option<Box<dyn LivenessModel>>,
}

enum EngineState {
    Ready(Box<FrameProcessor>),
    Unavailable(String),
    Shutdown,
}

/// What happened to one submitted frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FrameOutcome {
    /// Scanning is off; the frame was not looked at.
    Idle,
    /// Models are not loaded.
    Unavailable { reason: String },
    Processed {
        report: FrameReport,
        /// Identities that received their attendance entry on this frame.
        newly_recorded: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub models_loaded: bool,
    pub unavailable_reason: Option<String>,
    pub enrolled_count: usize,
    pub scanning: bool,
    pub session_active: bool,
}

pub struct RecognitionService {
    engine: Mutex<EngineState>,
    enrollment: EnrollmentStore,
    session: AttendanceSession,
    scanning: AtomicBool,
    sink: Arc<dyn AttendanceSink>,
    policies: Arc<dyn PolicySource>,
}

impl RecognitionService {
    pub fn init(
        models: Models,
        config: &RecognitionConfig,
        sink: Arc<dyn AttendanceSink>,
        policies: Arc<dyn PolicySource>,
    ) -> Self {
        let processor = FrameProcessor::new(
            models.detector,
            Recognizer::new(models.embedder),
            models.liveness_model,
            config,
        );
        tracing::info!("recognition service ready");
        Self::with_engine(EngineState::Ready(Box::new(processor)), sink, policies)
    }

    /// A service whose models failed to load. Session and listing calls
    /// still work; recognition reports the reason.
    pub fn unavailable(reason: impl Into<String>, sink: Arc<dyn AttendanceSink>, policies: Arc<dyn PolicySource>) -> Self {
        let reason = reason.into();
        tracing::warn!(reason = %reason, "recognition service unavailable");
        Self::with_engine(EngineState::Unavailable(reason), sink, policies)
    }

    fn with_engine(engine: EngineState, sink: Arc<dyn AttendanceSink>, policies: Arc<dyn PolicySource>) -> Self {
        Self {
            engine: Mutex::new(engine),
            enrollment: EnrollmentStore::new(),
            session: AttendanceSession::new(),
            scanning: AtomicBool::new(false),
            sink,
            policies,
        }
    }

    fn engine(&self) -> MutexGuard<'_, EngineState> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready_processor<'a>(
        engine: &'a mut MutexGuard<'_, EngineState>,
    ) -> Result<&'a mut FrameProcessor, ServiceError> {
        match &mut **engine {
            EngineState::Ready(p) => Ok(p.as_mut()),
            EngineState::Unavailable(reason) => Err(ServiceError::Unavailable(reason.clone())),
            EngineState::Shutdown => Err(ServiceError::ShutDown),
        }
    }

    /// Open a new class meeting and start scanning.
    pub fn start_session(&self, metadata: SessionMetadata) -> Result<Uuid, ServiceError> {
        let mut engine = self.engine();
        Self::ready_processor(&mut engine)?.reset_tracker();

        let class_id = metadata.class_id.clone();
        let id = self.session.start(metadata);
        self.scanning.store(true, Ordering::SeqCst);
        tracing::info!(session = %id, class = %class_id, "attendance session started");
        Ok(id)
    }

    /// Stop scanning and close the meeting. Returns its final state.
    pub fn stop_session(&self) -> AttendanceSessionState {
        self.scanning.store(false, Ordering::SeqCst);
        if let EngineState::Ready(p) = &mut *self.engine() {
            p.reset_tracker();
        }
        let last = self.session.stop();
        tracing::info!(
            session = ?last.session_id,
            attendees = last.entries.len(),
            "attendance session stopped"
        );
        last
    }

    pub fn session_snapshot(&self) -> AttendanceSessionState {
        self.session.snapshot()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Rebuild the enrolled table from `source`.
    ///
    /// Samples are decoded without the engine lock, which is taken once per
    /// embedding so frame processing keeps running during a reload.
    pub fn reload_enrollment(&self, source: &dyn EnrollmentSource) -> Result<LoadReport, ServiceError> {
        Self::ready_processor(&mut self.engine())?;
        let records = source.fetch()?;

        let (table, report) = enrollment::build_table(records, |sample| {
            let mut engine = self.engine();
            let processor =
                Self::ready_processor(&mut engine).map_err(|e| EnrollmentError::Unavailable(e.to_string()))?;
            Ok(processor.recognizer_mut().extract_from_crop(sample)?)
        });

        // The models went away mid-reload; keep the table we had.
        Self::ready_processor(&mut self.engine())?;
        self.enrollment.replace(table);
        Ok(report)
    }

    pub fn enrolled_identities(&self) -> Vec<EnrolledSummary> {
        self.enrollment.enrolled()
    }

    /// Run one camera frame through the pipeline and record any newly
    /// confirmed attendee.
    pub fn process_frame(&self, frame: &RgbImage) -> Result<FrameOutcome, ServiceError> {
        if !self.is_scanning() {
            return Ok(FrameOutcome::Idle);
        }

        let report = {
            let mut engine = self.engine();
            match &mut *engine {
                EngineState::Ready(p) => p.process(frame, &self.enrollment)?,
                EngineState::Unavailable(reason) => {
                    return Ok(FrameOutcome::Unavailable { reason: reason.clone() });
                }
                EngineState::Shutdown => return Err(ServiceError::ShutDown),
            }
        };

        let newly_recorded = report
            .confirmed
            .iter()
            .filter(|c| self.record_attendance(c))
            .map(|c| c.identity_id.clone())
            .collect();

        Ok(FrameOutcome::Processed { report, newly_recorded })
    }

    /// Add a confirmed identity to the session and, the first time only,
    /// evaluate its status and hand it to the sink.
    fn record_attendance(&self, confirmed: &ConfirmedIdentity) -> bool {
        let now = Utc::now();
        let Some(Admission { session_id, metadata }) = self.session.add_at(
            &confirmed.identity_id,
            &confirmed.display_name,
            confirmed.confidence,
            confirmed.liveness,
            now,
        ) else {
            return false;
        };

        let policy = match self.policies.policy_for(&metadata.class_id) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(class = %metadata.class_id, error = %e, "policy lookup failed; treating as present");
                None
            }
        };
        let status = resolve_status(policy.as_ref(), metadata.scheduled_start, now);

        let record = AttendanceRecord {
            identity_id: confirmed.identity_id.clone(),
            class_id: metadata.class_id.clone(),
            timetable_slot_id: metadata.timetable_slot_id.clone(),
            status,
            confidence: confirmed.confidence,
            timestamp: now,
        };

        let persisted = match self.sink.record(&record) {
            Ok(RecordOutcome::Inserted) => true,
            Ok(RecordOutcome::AlreadyRecorded) => {
                tracing::info!(identity = %record.identity_id, "attendance already on record");
                true
            }
            Err(e) => {
                tracing::warn!(identity = %record.identity_id, error = %e, "attendance sink write failed");
                false
            }
        };
        self.session.mark_recorded(session_id, &record.identity_id, status, persisted);

        tracing::info!(
            identity = %record.identity_id,
            session = %session_id,
            status = %status,
            confidence = record.confidence,
            persisted,
            "attendance marked"
        );
        true
    }

    pub fn status(&self) -> ServiceStatus {
        let (models_loaded, unavailable_reason) = match &*self.engine() {
            EngineState::Ready(_) => (true, None),
            EngineState::Unavailable(reason) => (false, Some(reason.clone())),
            EngineState::Shutdown => (false, Some("shut down".to_string())),
        };
        ServiceStatus {
            models_loaded,
            unavailable_reason,
            enrolled_count: self.enrollment.len(),
            scanning: self.is_scanning(),
            session_active: self.session.is_active(),
        }
    }

    /// Stop scanning and release the models. Further frames are rejected.
    pub fn shutdown(&self) {
        self.scanning.store(false, Ordering::SeqCst);
        *self.engine() = EngineState::Shutdown;
        tracing::info!("recognition service shut down");
    }
}
