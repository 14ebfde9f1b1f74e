//! Multi-frame identity consensus.
//!
//! A track follows one identity across consecutive frames. Every update ages
//! all tracks, drops the stale ones, then associates each detection with the
//! nearest live track of the same identity. Confirmation needs a run of
//! stable similarity readings, so a single lucky frame never confirms.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Frames a track survives without a detection.
    pub max_age: u32,
    /// Similarity readings kept per track.
    pub history_size: usize,
    /// Readings inspected by the stability check.
    pub stability_window: usize,
    /// Standard deviation under which a window counts as stable.
    pub stability_std: f32,
    pub confirmation_threshold: f32,
    /// Max centre distance (pixels) for associating a detection with a track.
    pub association_radius: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_age: 10,
            history_size: 5,
            stability_window: 3,
            stability_std: 0.08,
            confirmation_threshold: 2.0,
            association_radius: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// Seen once.
    New,
    /// Seen again, counter still under the threshold.
    Provisional,
    Confirmed,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub identity_id: String,
    pub display_name: String,
    pub center: (f32, f32),
    pub age_since_seen: u32,
    pub history: VecDeque<f32>,
    /// Mean of `history`.
    pub confidence: f32,
    pub confirmation_count: f32,
    pub state: TrackState,
}

impl Track {
    fn distance_to(&self, point: (f32, f32)) -> f32 {
        let dx = self.center.0 - point.0;
        let dy = self.center.1 - point.1;
        (dx * dx + dy * dy).sqrt()
    }

    fn observe(&mut self, detection: &TrackedDetection, config: &TrackerConfig) {
        self.center = detection.center;
        self.age_since_seen = 0;

        self.history.push_back(detection.similarity);
        while self.history.len() > config.history_size.max(1) {
            self.history.pop_front();
        }
        self.confidence = self.history.iter().sum::<f32>() / self.history.len() as f32;

        let window = config.stability_window.max(1).min(self.history.len());
        let recent = self.history.iter().skip(self.history.len() - window).copied();
        let step = if population_std(recent) < config.stability_std { 1.0 } else { 0.5 };
        // Monotonic, capped at threshold + 5.
        self.confirmation_count = (self.confirmation_count + step).min(config.confirmation_threshold + 5.0);

        self.state = if self.confirmation_count >= config.confirmation_threshold {
            TrackState::Confirmed
        } else {
            TrackState::Provisional
        };
    }
}

/// One matched face in the current frame.
#[derive(Debug, Clone)]
pub struct TrackedDetection {
    pub identity_id: String,
    pub display_name: String,
    pub center: (f32, f32),
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfirmedTrack {
    pub track_id: u64,
    pub identity_id: String,
    pub display_name: String,
    /// Smoothed similarity.
    pub confidence: f32,
    pub seen_this_frame: bool,
}

pub struct IdentityTracker {
    config: TrackerConfig,
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
}

impl IdentityTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self { config, tracks: BTreeMap::new(), next_id: 0 }
    }

    /// Advance one frame and return every confirmed track.
    pub fn update(&mut self, detections: &[TrackedDetection]) -> Vec<ConfirmedTrack> {
        for track in self.tracks.values_mut() {
            track.age_since_seen += 1;
        }
        let max_age = self.config.max_age;
        self.tracks.retain(|id, t| {
            let keep = t.age_since_seen <= max_age;
            if !keep {
                tracing::debug!(track = id, identity = %t.identity_id, "track aged out");
            }
            keep
        });

        for detection in detections {
            let nearest = self
                .tracks
                .values()
                .filter(|t| t.identity_id == detection.identity_id)
                .map(|t| (t.id, t.distance_to(detection.center)))
                .filter(|&(_, d)| d < self.config.association_radius)
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(id, _)| id);

            match nearest {
                Some(id) => {
                    if let Some(track) = self.tracks.get_mut(&id) {
                        track.observe(detection, &self.config);
                    }
                }
                None => self.spawn(detection),
            }
        }

        let seen = |t: &Track| t.age_since_seen == 0;
        self.tracks
            .values()
            .filter(|t| t.state == TrackState::Confirmed)
            .map(|t| ConfirmedTrack {
                track_id: t.id,
                identity_id: t.identity_id.clone(),
                display_name: t.display_name.clone(),
                confidence: t.confidence,
                seen_this_frame: seen(t),
            })
            .collect()
    }

    fn spawn(&mut self, detection: &TrackedDetection) {
        let id = self.next_id;
        self.next_id += 1;

        let confirmation_count = 1.0;
        let state = if confirmation_count >= self.config.confirmation_threshold {
            TrackState::Confirmed
        } else {
            TrackState::New
        };

        tracing::debug!(track = id, identity = %detection.identity_id, "track created");
        self.tracks.insert(
            id,
            Track {
                id,
                identity_id: detection.identity_id.clone(),
                display_name: detection.display_name.clone(),
                center: detection.center,
                age_since_seen: 0,
                history: VecDeque::from([detection.similarity]),
                confidence: detection.similarity,
                confirmation_count,
                state,
            },
        );
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 0;
    }

    pub fn track(&self, id: u64) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

fn population_std(values: impl Iterator<Item = f32>) -> f32 {
    let values: Vec<f32> = values.collect();
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt()
}
