//! Per-frame recognition pipeline.
//!
//! detect → select one face → liveness → descriptor → match → tracker.
//! The tracker advances on every frame, including frames with no face, so
//! idle tracks age out on schedule.

use crate::detector::{DetectionConfig, DetectorError, FaceDetector};
use crate::enrollment::{EnrollmentStore, IdentityMatch, MarginMatcher, MatchConfig, MatchOutcome};
use crate::liveness::{LivenessModel, LivenessScorer};
use crate::recognizer::Recognizer;
use crate::tracker::{IdentityTracker, TrackedDetection, TrackerConfig};
use crate::types::{BoundingBox, Descriptor};
use image::imageops;
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
}

/// Why a face was shown as unknown.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownReason {
    BelowThreshold,
    Ambiguous,
    NoEnrollment,
    /// The embedder gave nothing usable for this crop.
    NoDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaceKind {
    Recognized {
        identity_id: String,
        display_name: String,
        similarity: f32,
        /// UI percentage, see [`display_confidence`].
        display_confidence: f32,
        /// Whether the tracker has confirmed this identity.
        confirmed: bool,
    },
    Unknown {
        reason: UnknownReason,
        best: Option<IdentityMatch>,
    },
    Spoof {
        score: f32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceAnnotation {
    pub bbox: BoundingBox,
    pub liveness: f32,
    #[serde(flatten)]
    pub kind: FaceKind,
}

/// An identity the tracker confirmed on this frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfirmedIdentity {
    pub identity_id: String,
    pub display_name: String,
    /// Smoothed similarity from the tracker.
    pub confidence: f32,
    pub liveness: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameReport {
    pub faces: Vec<FaceAnnotation>,
    pub confirmed: Vec<ConfirmedIdentity>,
}

/// Map cosine similarity onto the 75-100 % scale shown to operators.
pub fn display_confidence(similarity: f32) -> f32 {
    let pct = if similarity >= 0.50 {
        95.0 + ((similarity - 0.50) / 0.20).min(1.0) * 5.0
    } else if similarity >= 0.40 {
        88.0 + (similarity - 0.40) / 0.10 * 7.0
    } else if similarity >= 0.30 {
        80.0 + (similarity - 0.30) / 0.10 * 8.0
    } else {
        75.0 + (similarity - 0.25) / 0.05 * 5.0
    };
    pct.clamp(75.0, 100.0)
}

pub struct FrameProcessor {
    detector: Box<dyn FaceDetector>,
    recognizer: Recognizer,
    liveness: LivenessScorer,
    tracker: IdentityTracker,
    matcher: MarginMatcher,
    detection: DetectionConfig,
}

impl FrameProcessor {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        recognizer: Recognizer,
        liveness_model: Option<Box<dyn LivenessModel>>,
        config: &crate::config::RecognitionConfig,
    ) -> Self {
        Self::with_parts(
            detector,
            recognizer,
            LivenessScorer::new(config.liveness.clone(), liveness_model),
            config.detection.clone(),
            config.matching.clone(),
            config.tracker.clone(),
        )
    }

    fn with_parts(
        detector: Box<dyn FaceDetector>,
        recognizer: Recognizer,
        liveness: LivenessScorer,
        detection: DetectionConfig,
        matching: MatchConfig,
        tracker: TrackerConfig,
    ) -> Self {
        Self {
            detector,
            recognizer,
            liveness,
            tracker: IdentityTracker::new(tracker),
            matcher: MarginMatcher { config: matching },
            detection,
        }
    }

    pub fn recognizer_mut(&mut self) -> &mut Recognizer {
        &mut self.recognizer
    }

    pub fn reset_tracker(&mut self) {
        self.tracker.reset();
    }

    pub fn process(&mut self, frame: &RgbImage, enrollment: &EnrollmentStore) -> Result<FrameReport, PipelineError> {
        let (width, height) = frame.dimensions();
        let candidates = match self.detector.detect(frame) {
            Ok(candidates) => candidates,
            Err(e) => {
                // A failed frame still ages every track.
                self.tracker.update(&[]);
                return Err(e.into());
            }
        };
        let best = self.detection.select_best(candidates, width, height);

        let mut report = FrameReport::default();
        let mut detections = Vec::new();

        if let Some(face) = best {
            let crop = imageops::crop_imm(frame, face.x as u32, face.y as u32, face.width as u32, face.height as u32)
                .to_image();
            let verdict = self.liveness.assess(&crop);

            let kind = if !verdict.is_live {
                tracing::debug!(score = verdict.score, "face rejected by liveness");
                FaceKind::Spoof { score: verdict.score }
            } else {
                match self.recognizer.extract(frame, &face) {
                    Ok(descriptor) => self.classify(&descriptor, &face, enrollment, &mut detections),
                    Err(e) => {
                        tracing::debug!(error = %e, "no descriptor for face");
                        FaceKind::Unknown { reason: UnknownReason::NoDescriptor, best: None }
                    }
                }
            };
            report.faces.push(FaceAnnotation { bbox: face, liveness: verdict.score, kind });
        }

        let confirmed = self.tracker.update(&detections);

        for annotation in &mut report.faces {
            if let FaceKind::Recognized { identity_id, display_name, confirmed: is_confirmed, .. } = &mut annotation.kind {
                if let Some(track) = confirmed.iter().find(|t| t.seen_this_frame && t.identity_id == *identity_id) {
                    *is_confirmed = true;
                    report.confirmed.push(ConfirmedIdentity {
                        identity_id: identity_id.clone(),
                        display_name: display_name.clone(),
                        confidence: track.confidence,
                        liveness: annotation.liveness,
                    });
                }
            }
        }

        Ok(report)
    }

    /// Match one live face and queue it for the tracker when it matched.
    fn classify(
        &self,
        descriptor: &Descriptor,
        face: &BoundingBox,
        enrollment: &EnrollmentStore,
        detections: &mut Vec<TrackedDetection>,
    ) -> FaceKind {
        match enrollment.match_descriptor(descriptor, &self.matcher) {
            MatchOutcome::Matched(m) => {
                detections.push(TrackedDetection {
                    identity_id: m.identity_id.clone(),
                    display_name: m.display_name.clone(),
                    center: face.center(),
                    similarity: m.similarity,
                });
                FaceKind::Recognized {
                    display_confidence: display_confidence(m.similarity),
                    identity_id: m.identity_id,
                    display_name: m.display_name,
                    similarity: m.similarity,
                    confirmed: false,
                }
            }
            MatchOutcome::BelowThreshold { best } => {
                FaceKind::Unknown { reason: UnknownReason::BelowThreshold, best: Some(best) }
            }
            MatchOutcome::Ambiguous { best, runner_up } => {
                tracing::debug!(
                    best = %best.identity_id,
                    runner_up = %runner_up.identity_id,
                    gap = best.similarity - runner_up.similarity,
                    "ambiguous match"
                );
                FaceKind::Unknown { reason: UnknownReason::Ambiguous, best: Some(best) }
            }
            MatchOutcome::NoEnrollment => FaceKind::Unknown { reason: UnknownReason::NoEnrollment, best: None },
        }
    }
}
