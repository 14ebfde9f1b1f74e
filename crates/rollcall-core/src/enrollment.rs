//! Enrolled population and nearest-neighbour matching.
//!
//! Each identity is held as one averaged, unit-norm descriptor. The table is
//! an immutable `Arc<Vec<_>>` swapped wholesale on reload, so a matcher that
//! took a snapshot keeps a consistent view for as long as it needs one.

use crate::recognizer::{Recognizer, RecognizerError};
use crate::source::IdentityRecord;
use crate::types::Descriptor;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("image decode: {0}")]
    Decode(#[from] image::ImageError),
    #[error("descriptor extraction: {0}")]
    Extraction(#[from] RecognizerError),
    #[error("{0}")]
    Unavailable(String),
    #[error("no usable samples")]
    NoUsableSamples,
    #[error("samples produced descriptors of different dimensions or cancelled out")]
    InconsistentSamples,
}

/// One enrolled person.
#[derive(Debug, Clone, Serialize)]
pub struct EnrolledIdentity {
    pub identity_id: String,
    pub display_name: String,
    pub descriptor: Descriptor,
    pub sample_count: usize,
}

/// Listing entry without the descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrolledSummary {
    pub identity_id: String,
    pub display_name: String,
    pub sample_count: usize,
}

/// A sample (or a whole identity when `sample` is `None`) that did not make it in.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentFailure {
    pub identity_id: String,
    pub sample: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub enrolled: Vec<EnrolledSummary>,
    pub failures: Vec<EnrollmentFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Minimum cosine similarity for a match.
    pub threshold: f32,
    /// Required lead of the best match over the runner-up.
    pub min_gap: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self { threshold: 0.28, min_gap: 0.02 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityMatch {
    pub identity_id: String,
    pub display_name: String,
    pub similarity: f32,
}

/// Result of matching one descriptor against the enrolled table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched(IdentityMatch),
    /// Best similarity was under the threshold.
    BelowThreshold { best: IdentityMatch },
    /// Best and runner-up were closer than the required gap.
    Ambiguous { best: IdentityMatch, runner_up: IdentityMatch },
    NoEnrollment,
}

impl MatchOutcome {
    pub fn matched(&self) -> Option<&IdentityMatch> {
        match self {
            MatchOutcome::Matched(m) => Some(m),
            _ => None,
        }
    }

    /// Best candidate regardless of whether it was accepted.
    pub fn best(&self) -> Option<&IdentityMatch> {
        match self {
            MatchOutcome::Matched(m) => Some(m),
            MatchOutcome::BelowThreshold { best } | MatchOutcome::Ambiguous { best, .. } => Some(best),
            MatchOutcome::NoEnrollment => None,
        }
    }
}

/// Strategy for comparing a probe descriptor against the enrolled table.
pub trait Matcher {
    fn find(&self, probe: &Descriptor, gallery: &[EnrolledIdentity]) -> MatchOutcome;
}

/// Linear scan with an absolute threshold and a best-vs-runner-up margin.
pub struct MarginMatcher {
    pub config: MatchConfig,
}

impl Matcher for MarginMatcher {
    fn find(&self, probe: &Descriptor, gallery: &[EnrolledIdentity]) -> MatchOutcome {
        let mut scored: Vec<(f32, &EnrolledIdentity)> =
            gallery.iter().map(|e| (probe.similarity(&e.descriptor), e)).collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let as_match = |(similarity, e): (f32, &EnrolledIdentity)| IdentityMatch {
            identity_id: e.identity_id.clone(),
            display_name: e.display_name.clone(),
            similarity,
        };

        let mut ranked = scored.into_iter();
        let Some(best) = ranked.next() else {
            return MatchOutcome::NoEnrollment;
        };

        if best.0 < self.config.threshold {
            return MatchOutcome::BelowThreshold { best: as_match(best) };
        }

        if let Some(second) = ranked.next() {
            if best.0 - second.0 < self.config.min_gap {
                return MatchOutcome::Ambiguous { best: as_match(best), runner_up: as_match(second) };
            }
        }

        MatchOutcome::Matched(as_match(best))
    }
}

/// Thread-safe holder of the enrolled table.
#[derive(Default)]
pub struct EnrollmentStore {
    table: Mutex<Arc<Vec<EnrolledIdentity>>>,
}

impl EnrollmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a new table from `records` with `recognizer` and swap it in.
    pub fn load(&self, records: Vec<IdentityRecord>, recognizer: &mut Recognizer) -> LoadReport {
        let (table, report) = build_table(records, |sample| Ok(recognizer.extract_from_crop(sample)?));
        self.replace(table);
        report
    }

    /// Swap in a prepared table.
    pub fn replace(&self, table: Vec<EnrolledIdentity>) {
        *self.table.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
    }

    /// Current table. Holding the `Arc` does not block reloads.
    pub fn snapshot(&self) -> Arc<Vec<EnrolledIdentity>> {
        Arc::clone(&self.table.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn match_descriptor(&self, probe: &Descriptor, matcher: &dyn Matcher) -> MatchOutcome {
        let table = self.snapshot();
        matcher.find(probe, &table)
    }

    /// Enrolled identities sorted by id.
    pub fn enrolled(&self) -> Vec<EnrolledSummary> {
        let mut list: Vec<EnrolledSummary> = self
            .snapshot()
            .iter()
            .map(|e| EnrolledSummary {
                identity_id: e.identity_id.clone(),
                display_name: e.display_name.clone(),
                sample_count: e.sample_count,
            })
            .collect();
        list.sort_by(|a, b| a.identity_id.cmp(&b.identity_id));
        list
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build an enrolled table from `records` without touching any store.
/// `describe` turns one decoded sample into a descriptor.
///
/// Samples that fail to decode or extract are skipped and reported.
/// Identities with no usable sample are left out and reported.
pub fn build_table<F>(records: Vec<IdentityRecord>, mut describe: F) -> (Vec<EnrolledIdentity>, LoadReport)
where
    F: FnMut(&RgbImage) -> Result<Descriptor, EnrollmentError>,
{
    let mut report = LoadReport::default();
    let mut table = Vec::with_capacity(records.len());

    for record in records {
        let mut descriptors = Vec::with_capacity(record.samples.len());
        for sample in &record.samples {
            let described = image::load_from_memory(&sample.bytes)
                .map_err(EnrollmentError::from)
                .and_then(|decoded| describe(&decoded.to_rgb8()));
            match described {
                Ok(d) => descriptors.push(d),
                Err(e) => {
                    tracing::debug!(identity = %record.identity_id, sample = %sample.label, error = %e, "sample rejected");
                    report.failures.push(EnrollmentFailure {
                        identity_id: record.identity_id.clone(),
                        sample: Some(sample.label.clone()),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let descriptor = if descriptors.is_empty() {
            Err(EnrollmentError::NoUsableSamples)
        } else {
            Descriptor::mean(&descriptors).ok_or(EnrollmentError::InconsistentSamples)
        };

        match descriptor {
            Ok(descriptor) => {
                report.enrolled.push(EnrolledSummary {
                    identity_id: record.identity_id.clone(),
                    display_name: record.display_name.clone(),
                    sample_count: descriptors.len(),
                });
                table.push(EnrolledIdentity {
                    identity_id: record.identity_id,
                    display_name: record.display_name,
                    descriptor,
                    sample_count: descriptors.len(),
                });
            }
            Err(e) => {
                tracing::warn!(identity = %record.identity_id, error = %e, "identity not enrolled");
                report.failures.push(EnrollmentFailure {
                    identity_id: record.identity_id,
                    sample: None,
                    reason: e.to_string(),
                });
            }
        }
    }

    report.enrolled.sort_by(|a, b| a.identity_id.cmp(&b.identity_id));
    tracing::info!(
        enrolled = table.len(),
        failures = report.failures.len(),
        "enrollment table built"
    );
    (table, report)
}
