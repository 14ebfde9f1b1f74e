//! Enrollment image sources.
//!
//! A source hands out raw sample bytes per identity. Decoding happens in
//! [`crate::enrollment::EnrollmentStore::load`] so a corrupt file shows up in
//! the load report instead of aborting the fetch.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SAMPLE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];
const ROSTER_FILE: &str = "roster.toml";

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("enrollment directory not found: {0}")]
    NotFound(PathBuf),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid roster {path}: {source}")]
    Roster {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// One reference image, undecoded.
#[derive(Debug, Clone)]
pub struct SampleImage {
    /// Where the sample came from (file name, URL, ...), used in reports.
    pub label: String,
    pub bytes: Vec<u8>,
}

/// All reference images for one identity.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub identity_id: String,
    pub display_name: String,
    pub samples: Vec<SampleImage>,
}

/// External store keyed by identity id.
pub trait EnrollmentSource: Send + Sync {
    fn fetch(&self) -> Result<Vec<IdentityRecord>, SourceError>;
}

impl EnrollmentSource for Vec<IdentityRecord> {
    fn fetch(&self) -> Result<Vec<IdentityRecord>, SourceError> {
        Ok(self.clone())
    }
}

#[derive(Debug, Deserialize, Default)]
struct Roster {
    #[serde(default)]
    identity: Vec<RosterEntry>,
}

#[derive(Debug, Deserialize)]
struct RosterEntry {
    id: String,
    name: String,
}

/// `<root>/<identity_id>/*.{jpg,jpeg,png,bmp}` with an optional
/// `<root>/roster.toml`:
///
/// ```toml
/// [[identity]]
/// id = "S001"
/// name = "Ada Lovelace"
/// ```
///
/// Roster entries without a directory are returned with no samples so the
/// load report can flag them.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_roster(&self) -> Result<BTreeMap<String, String>, SourceError> {
        let path = self.root.join(ROSTER_FILE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let text = std::fs::read_to_string(&path).map_err(|source| SourceError::Io { path: path.clone(), source })?;
        let roster: Roster = toml::from_str(&text).map_err(|source| SourceError::Roster { path, source })?;
        Ok(roster.identity.into_iter().map(|e| (e.id, e.name)).collect())
    }

    fn read_samples(dir: &Path) -> Result<Vec<SampleImage>, SourceError> {
        let io_err = |source| SourceError::Io { path: dir.to_path_buf(), source };
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(io_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_sample_file(p))
            .collect();
        paths.sort();

        let mut samples = Vec::with_capacity(paths.len());
        for path in paths {
            let label = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match std::fs::read(&path) {
                Ok(bytes) => samples.push(SampleImage { label, bytes }),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable sample"),
            }
        }
        Ok(samples)
    }
}

fn is_sample_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SAMPLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl EnrollmentSource for DirectorySource {
    fn fetch(&self) -> Result<Vec<IdentityRecord>, SourceError> {
        if !self.root.is_dir() {
            return Err(SourceError::NotFound(self.root.clone()));
        }

        let mut names = self.read_roster()?;
        let mut records = BTreeMap::new();

        let entries = std::fs::read_dir(&self.root).map_err(|source| SourceError::Io { path: self.root.clone(), source })?;
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let identity_id = entry.file_name().to_string_lossy().into_owned();
            let display_name = names.remove(&identity_id).unwrap_or_else(|| identity_id.clone());
            let samples = Self::read_samples(&path)?;
            records.insert(identity_id.clone(), IdentityRecord { identity_id, display_name, samples });
        }

        for (identity_id, display_name) in names {
            records.insert(identity_id.clone(), IdentityRecord { identity_id, display_name, samples: Vec::new() });
        }

        tracing::debug!(root = %self.root.display(), identities = records.len(), "enrollment directory scanned");
        Ok(records.into_values().collect())
    }
}
