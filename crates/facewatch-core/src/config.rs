use crate::cell::ArcCell;
use crate::classifier::ClassifierKind;
use crate::trainer::MultiFacePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings consulted on every classify call.
///
/// Shared through an [`ArcCell`] and replaced whole; see [`update_threshold`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionConfig {
    /// Maximum centroid distance still accepted as a known identity.
    pub threshold: f32,
    pub classifier: ClassifierKind,
    /// Margin-rule probabilities below this are reported as unknown.
    pub min_margin_confidence: f32,
    /// Display name for the unknown identity.
    pub unknown_name: String,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.55,
            classifier: ClassifierKind::Centroid,
            min_margin_confidence: 0.6,
            unknown_name: "unknown".to_string(),
        }
    }
}

impl RecognitionConfig {
    /// Copy of this config with a different distance threshold.
    pub fn with_threshold(&self, threshold: f32) -> Result<Self, ConfigError> {
        let next = Self {
            threshold,
            ..self.clone()
        };
        next.validate()?;
        Ok(next)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "threshold must be positive, got {}",
                self.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.min_margin_confidence) {
            return Err(ConfigError::Invalid(format!(
                "min_margin_confidence must be within [0, 1], got {}",
                self.min_margin_confidence
            )));
        }
        Ok(())
    }
}

/// Install a copy of the current recognition config with a new threshold.
///
/// Readers holding the previous config keep it until their next load.
pub fn update_threshold(
    cell: &ArcCell<RecognitionConfig>,
    threshold: f32,
) -> Result<Arc<RecognitionConfig>, ConfigError> {
    let installed = cell.update(|current| current.with_threshold(threshold))?;
    tracing::info!(threshold, "recognition threshold updated");
    Ok(installed)
}

/// Application configuration: optional TOML file, then `FACEWATCH_*`
/// environment overrides, then defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for dataset, uploads, results and model snapshots.
    pub data_dir: PathBuf,
    /// Model snapshot directory (default: `<data_dir>/models`).
    pub model_dir: Option<PathBuf>,
    /// Directory containing the ONNX detector and embedder files.
    pub onnx_dir: PathBuf,
    pub camera_index: u32,
    pub camera_enabled: bool,
    pub threshold: f32,
    pub classifier: ClassifierKind,
    pub unknown_name: String,
    /// Dataset folder names that receive labels 0, 1, 2, ... in order.
    pub identities: Vec<String>,
    pub multi_face: MultiFacePolicy,
    /// Run recognition on every N-th frame.
    pub frame_skip: u64,
    /// Downscale factor applied before detection.
    pub scale_factor: f32,
    /// Frames a cached result set survives without a refresh.
    pub cache_frames: u64,
    pub handoff_interval_ms: u64,
    pub poll_interval_secs: u64,
    pub auto_process: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facewatch");

        Self {
            onnx_dir: data_dir.join("onnx"),
            data_dir,
            model_dir: None,
            camera_index: 0,
            camera_enabled: true,
            threshold: 0.55,
            classifier: ClassifierKind::Centroid,
            unknown_name: "unknown".to_string(),
            identities: Vec::new(),
            multi_face: MultiFacePolicy::First,
            frame_skip: 3,
            scale_factor: 0.5,
            cache_frames: 5,
            handoff_interval_ms: 33,
            poll_interval_secs: 5,
            auto_process: true,
        }
    }
}

impl Config {
    /// Load from `FACEWATCH_CONFIG` (if set) and `FACEWATCH_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("FACEWATCH_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("FACEWATCH_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("FACEWATCH_MODEL_DIR") {
            self.model_dir = Some(PathBuf::from(dir));
        }
        if let Ok(dir) = std::env::var("FACEWATCH_ONNX_DIR") {
            self.onnx_dir = PathBuf::from(dir);
        }
        if let Ok(list) = std::env::var("FACEWATCH_IDENTITIES") {
            self.identities = parse_list(&list);
        }
        if let Ok(name) = std::env::var("FACEWATCH_UNKNOWN_NAME") {
            self.unknown_name = name;
        }
        override_from_env("FACEWATCH_CAMERA_INDEX", &mut self.camera_index);
        override_from_env("FACEWATCH_THRESHOLD", &mut self.threshold);
        override_from_env("FACEWATCH_CLASSIFIER", &mut self.classifier);
        override_from_env("FACEWATCH_MULTI_FACE", &mut self.multi_face);
        override_from_env("FACEWATCH_FRAME_SKIP", &mut self.frame_skip);
        override_from_env("FACEWATCH_SCALE_FACTOR", &mut self.scale_factor);
        override_from_env("FACEWATCH_CACHE_FRAMES", &mut self.cache_frames);
        override_from_env("FACEWATCH_HANDOFF_MS", &mut self.handoff_interval_ms);
        override_from_env("FACEWATCH_POLL_SECS", &mut self.poll_interval_secs);
        self.auto_process = env_flag("FACEWATCH_AUTO_PROCESS", self.auto_process);
        self.camera_enabled = env_flag("FACEWATCH_CAMERA_ENABLED", self.camera_enabled);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.recognition().validate()?;
        if self.frame_skip == 0 {
            return Err(ConfigError::Invalid("frame_skip must be at least 1".into()));
        }
        if !(self.scale_factor > 0.0 && self.scale_factor <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "scale_factor must be within (0, 1], got {}",
                self.scale_factor
            )));
        }
        for (i, name) in self.identities.iter().enumerate() {
            if name.is_empty() || self.identities[..i].contains(name) {
                return Err(ConfigError::Invalid(format!("bad identity name: {name:?}")));
            }
            if name.eq_ignore_ascii_case(&self.unknown_name) {
                return Err(ConfigError::Invalid(format!(
                    "identity {name:?} collides with the unknown bucket"
                )));
            }
        }
        Ok(())
    }

    pub fn recognition(&self) -> RecognitionConfig {
        RecognitionConfig {
            threshold: self.threshold,
            classifier: self.classifier,
            unknown_name: self.unknown_name.clone(),
            ..RecognitionConfig::default()
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models"))
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.data_dir.join("dataset")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.uploads_dir().join("processed")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.results_dir().join("reports")
    }

    /// Per-frame reports for processed video files.
    pub fn videos_dir(&self) -> PathBuf {
        self.results_dir().join("videos")
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.onnx_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.onnx_dir.join("w600k_r50.onnx")
    }

    /// Create the data directory layout if it does not exist yet.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.models_dir())?;
        std::fs::create_dir_all(self.dataset_dir().join(&self.unknown_name))?;
        for identity in &self.identities {
            std::fs::create_dir_all(self.dataset_dir().join(identity))?;
        }
        std::fs::create_dir_all(self.archive_dir())?;
        std::fs::create_dir_all(self.reports_dir())?;
        std::fs::create_dir_all(self.videos_dir())?;
        Ok(())
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn override_from_env<T: FromStr>(key: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_threshold_produces_new_value() {
        let base = RecognitionConfig::default();
        let next = base.with_threshold(0.7).unwrap();
        assert_eq!(next.threshold, 0.7);
        assert_eq!(base.threshold, 0.55);
        assert_eq!(next.classifier, base.classifier);
    }

    #[test]
    fn test_with_threshold_rejects_non_positive() {
        let base = RecognitionConfig::default();
        assert!(base.with_threshold(0.0).is_err());
        assert!(base.with_threshold(-1.0).is_err());
        assert!(base.with_threshold(f32::NAN).is_err());
    }

    #[test]
    fn test_update_threshold_swaps_cell() {
        let cell = ArcCell::new(RecognitionConfig::default());
        let held = cell.load();
        update_threshold(&cell, 0.4).unwrap();
        assert_eq!(held.threshold, 0.55);
        assert_eq!(cell.load().threshold, 0.4);

        assert!(update_threshold(&cell, 0.0).is_err());
        assert_eq!(cell.load().threshold, 0.4);
    }

    #[test]
    fn test_update_threshold_keeps_concurrent_changes() {
        let cell = Arc::new(ArcCell::new(RecognitionConfig::default()));
        let writer = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || {
                for i in 1..=200 {
                    let installed = update_threshold(&cell, i as f32 / 100.0).unwrap();
                    assert_eq!(installed.threshold, i as f32 / 100.0);
                }
            })
        };
        for _ in 0..200 {
            cell.update(|c| {
                Ok::<_, ConfigError>(RecognitionConfig {
                    min_margin_confidence: c.min_margin_confidence + 0.001,
                    ..c.clone()
                })
            })
            .unwrap();
        }
        writer.join().unwrap();

        let last = cell.load();
        assert_eq!(last.threshold, 2.0);
        assert!((last.min_margin_confidence - 0.8).abs() < 1e-3);
    }

    #[test]
    fn test_from_toml_with_defaults() {
        let config = Config::from_toml(
            r#"
            data_dir = "/srv/facewatch"
            identities = ["alice", "bob"]
            classifier = "margin"
            frame_skip = 4
            multi_face = "largest"
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/facewatch"));
        assert_eq!(config.identities, vec!["alice", "bob"]);
        assert_eq!(config.classifier, ClassifierKind::Margin);
        assert_eq!(config.multi_face, MultiFacePolicy::Largest);
        assert_eq!(config.frame_skip, 4);
        assert_eq!(config.cache_frames, 5);
        assert_eq!(config.models_dir(), PathBuf::from("/srv/facewatch/models"));
        assert_eq!(config.archive_dir(), PathBuf::from("/srv/facewatch/uploads/processed"));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.frame_skip = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scale_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.identities = vec!["alice".into(), "alice".into()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.identities = vec!["Unknown".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list(" alice, ,bob "), vec!["alice", "bob"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_ensure_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            identities: vec!["alice".into()],
            ..Config::default()
        };
        config.ensure_layout().unwrap();
        assert!(config.dataset_dir().join("alice").is_dir());
        assert!(config.dataset_dir().join("unknown").is_dir());
        assert!(config.archive_dir().is_dir());
        assert!(config.reports_dir().is_dir());
        assert!(config.videos_dir().is_dir());
        assert!(config.models_dir().is_dir());
    }
}
