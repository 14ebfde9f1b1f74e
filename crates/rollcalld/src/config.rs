use rollcall_core::config::ConfigError;
use rollcall_core::RecognitionConfig;
use std::path::{Path, PathBuf};

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Root of the enrollment photo tree (`<dir>/<identity_id>/*.jpg`).
    pub enrollment_dir: PathBuf,
    /// Number of frames to discard after the camera opens (AGC/AE settling).
    pub warmup_frames: usize,
    /// Connect to the session bus instead of the system bus.
    pub session_bus: bool,
    /// Pipeline tunables, from `ROLLCALL_CONFIG` plus env overrides.
    pub recognition: RecognitionConfig,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let model_dir = var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(rollcall_core::default_model_dir);

        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let mut recognition = match var("ROLLCALL_CONFIG") {
            Some(path) => RecognitionConfig::load(Path::new(&path))?,
            None => RecognitionConfig::default(),
        };
        if let Some(v) = parse(&var, "ROLLCALL_MATCH_THRESHOLD") {
            recognition.matching.threshold = v;
        }
        if let Some(v) = parse(&var, "ROLLCALL_MATCH_MIN_GAP") {
            recognition.matching.min_gap = v;
        }
        if let Some(v) = parse(&var, "ROLLCALL_LIVENESS_THRESHOLD") {
            recognition.liveness.threshold = v;
        }
        if let Some(v) = var("ROLLCALL_LIVENESS_ENABLED") {
            recognition.liveness.enabled = v != "0";
        }

        Ok(Self {
            camera_device: var("ROLLCALL_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            model_dir,
            db_path: var("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("attendance.db")),
            enrollment_dir: var("ROLLCALL_ENROLLMENT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("faces")),
            warmup_frames: parse(&var, "ROLLCALL_WARMUP_FRAMES").unwrap_or(4),
            session_bus: var("ROLLCALL_BUS").is_some_and(|v| v == "session"),
            recognition,
        })
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the face descriptor model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }

    /// Path to the optional anti-spoofing model.
    pub fn liveness_model_path(&self) -> PathBuf {
        self.model_dir.join("antispoof_128.onnx")
    }
}

fn parse<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_lookup(lookup(&[("HOME", "/home/ops")])).unwrap();
        assert_eq!(cfg.camera_device, "/dev/video0");
        assert_eq!(cfg.db_path, PathBuf::from("/home/ops/.local/share/rollcall/attendance.db"));
        assert_eq!(cfg.enrollment_dir, PathBuf::from("/home/ops/.local/share/rollcall/faces"));
        assert_eq!(cfg.warmup_frames, 4);
        assert!(!cfg.session_bus);
        assert_eq!(cfg.recognition.matching.threshold, 0.28);
    }

    #[test]
    fn test_env_overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("ROLLCALL_CAMERA_DEVICE", "/dev/video4"),
            ("ROLLCALL_MODEL_DIR", "/opt/models"),
            ("ROLLCALL_MATCH_THRESHOLD", "0.33"),
            ("ROLLCALL_LIVENESS_ENABLED", "0"),
            ("ROLLCALL_WARMUP_FRAMES", "not-a-number"),
            ("ROLLCALL_BUS", "session"),
        ]))
        .unwrap();
        assert_eq!(cfg.camera_device, "/dev/video4");
        assert_eq!(cfg.detector_model_path(), PathBuf::from("/opt/models/det_10g.onnx"));
        assert_eq!(cfg.recognition.matching.threshold, 0.33);
        assert_eq!(cfg.recognition.matching.min_gap, 0.02);
        assert!(!cfg.recognition.liveness.enabled);
        assert_eq!(cfg.warmup_frames, 4);
        assert!(cfg.session_bus);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let result = Config::from_lookup(lookup(&[("ROLLCALL_CONFIG", "/nonexistent/rollcall.toml")]));
        assert!(result.is_err());
    }
}
