use crate::detector::DetectionConfig;
use crate::enrollment::MatchConfig;
use crate::liveness::LivenessConfig;
use crate::tracker::TrackerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid recognition config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Every tunable of the recognition pipeline. Missing tables and keys take
/// their defaults, so an empty file is a valid configuration.
///
/// ```toml
/// [matching]
/// threshold = 0.30
///
/// [liveness]
/// fail_policy = "fail_closed"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub detection: DetectionConfig,
    pub matching: MatchConfig,
    pub tracker: TrackerConfig,
    pub liveness: LivenessConfig,
}

impl RecognitionConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
