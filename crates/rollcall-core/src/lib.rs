//! rollcall-core: Face-identity attendance matching engine.
//!
//! Detection and descriptor extraction run behind swappable adapter traits
//! (ONNX Runtime implementations included). On top of them sit liveness
//! screening, margin-based matching against the enrolled population,
//! multi-frame identity confirmation and the at-most-once attendance session.

pub mod alignment;
pub mod config;
pub mod detector;
pub mod enhance;
pub mod enrollment;
pub mod liveness;
pub mod pipeline;
pub mod policy;
pub mod recognizer;
pub mod service;
pub mod session;
pub mod sink;
pub mod source;
pub mod tracker;
pub mod types;

pub use config::RecognitionConfig;
pub use detector::{FaceDetector, OnnxDetector};
pub use enrollment::{EnrollmentStore, LoadReport, MatchOutcome};
pub use liveness::{LivenessScorer, OnnxLivenessModel};
pub use pipeline::{FrameProcessor, FrameReport};
pub use policy::{AttendancePolicy, AttendanceStatus, PolicySource};
pub use recognizer::{FaceEmbedder, OnnxEmbedder, Recognizer};
pub use service::{FrameOutcome, Models, RecognitionService, ServiceError, ServiceStatus};
pub use session::{AttendanceSession, AttendanceSessionState, SessionMetadata};
pub use sink::{AttendanceRecord, AttendanceSink, RecordOutcome, SinkError};
pub use source::{DirectorySource, EnrollmentSource};
pub use types::{BoundingBox, Descriptor};

use std::path::PathBuf;

/// Default directory for ONNX model files.
///
/// `$XDG_DATA_HOME/rollcall/models`, falling back to
/// `$HOME/.local/share/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}
