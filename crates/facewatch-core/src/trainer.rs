//! Dataset extraction, centroid and margin-model fitting, persistence.

use crate::config::Config;
use crate::margin::{stratified_split, ClassMetrics, MarginModel, MarginParams};
use crate::snapshot::ModelSnapshot;
use crate::source::{list_images, load_image, EmbeddingSource};
use crate::store::{ModelStore, StoreError, TrainedArtifacts};
use crate::types::{DetectedFace, EmbeddingSet, Label, UNKNOWN_LABEL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("not enough training data: {0}")]
    TrainingDataInsufficient(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("training already in progress")]
    AlreadyRunning,
    #[error("training worker is not running")]
    ChannelClosed,
}

/// What to do with a training image that shows more than one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiFacePolicy {
    /// Keep the first face the detector reports.
    #[default]
    First,
    /// Keep the face with the largest region.
    Largest,
    /// Skip the image.
    Reject,
}

impl std::str::FromStr for MultiFacePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(Self::First),
            "largest" => Ok(Self::Largest),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown multi-face policy: {other}")),
        }
    }
}

impl MultiFacePolicy {
    fn pick<'a>(&self, faces: &'a [DetectedFace]) -> Option<&'a DetectedFace> {
        match (self, faces.len()) {
            (_, 0) => None,
            (_, 1) | (Self::First, _) => faces.first(),
            (Self::Largest, _) => faces.iter().reduce(|best, f| {
                if f.region.area() > best.region.area() {
                    f
                } else {
                    best
                }
            }),
            (Self::Reject, _) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub dataset_dir: PathBuf,
    /// Folder names that become labels 0, 1, 2, ... When empty, every
    /// folder except the unknown one is enrolled in sorted order.
    pub identities: Vec<String>,
    pub unknown_name: String,
    pub multi_face: MultiFacePolicy,
    pub margin: MarginParams,
}

impl TrainingConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dataset_dir: config.dataset_dir(),
            identities: config.identities.clone(),
            unknown_name: config.unknown_name.clone(),
            multi_face: config.multi_face,
            margin: MarginParams::default(),
        }
    }
}

/// Counters from one pass over the dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionStats {
    pub images_seen: usize,
    pub embedded: usize,
    pub no_face: usize,
    pub multi_face: usize,
    pub rejected: usize,
    pub failed: usize,
    /// Embeddings kept per dataset folder.
    pub per_folder: BTreeMap<String, usize>,
}

/// Embeddings plus the label-name table observed while extracting them.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub set: EmbeddingSet,
    pub names: BTreeMap<Label, String>,
    pub stats: ExtractionStats,
}

#[derive(Debug, Clone)]
pub struct MarginFit {
    pub model: MarginModel,
    /// Accuracy on the held-out rows, when any were held out.
    pub test_accuracy: Option<f32>,
    /// Held-out precision and recall per label.
    pub per_class: BTreeMap<Label, ClassMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub generation: String,
    pub embeddings: usize,
    pub classes: usize,
    pub names: BTreeMap<Label, String>,
    pub margin_trained: bool,
    pub test_accuracy: Option<f32>,
    /// Held-out scores keyed by person name.
    pub class_metrics: BTreeMap<String, ClassMetrics>,
    pub extraction: ExtractionStats,
    pub elapsed_ms: u64,
}

/// Result of [`Trainer::train_full`].
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub snapshot: ModelSnapshot,
    pub report: TrainingReport,
}

pub struct Trainer {
    source: Box<dyn EmbeddingSource>,
    config: TrainingConfig,
}

impl Trainer {
    pub fn new(source: Box<dyn EmbeddingSource>, config: TrainingConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    fn label_for(&self, folder: &str, enrolled: &[String]) -> Label {
        if folder.eq_ignore_ascii_case(&self.config.unknown_name) {
            return UNKNOWN_LABEL;
        }
        enrolled
            .iter()
            .position(|name| name == folder)
            .map_or(UNKNOWN_LABEL, |i| i as Label)
    }

    fn person_folders(&self) -> Result<Vec<(String, PathBuf)>, TrainingError> {
        let root = &self.config.dataset_dir;
        let io = |source| TrainingError::Io {
            path: root.clone(),
            source,
        };
        let mut folders = Vec::new();
        for entry in std::fs::read_dir(root).map_err(io)? {
            let entry = entry.map_err(io)?;
            if !entry.file_type().map_err(io)?.is_dir() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                folders.push((name, entry.path()));
            }
        }
        folders.sort();
        Ok(folders)
    }

    /// Walk the dataset and embed one face per usable image.
    pub fn build_embeddings(&mut self) -> Result<Extraction, TrainingError> {
        let folders = self.person_folders()?;
        let enrolled: Vec<String> = if self.config.identities.is_empty() {
            folders
                .iter()
                .map(|(name, _)| name.clone())
                .filter(|name| !name.eq_ignore_ascii_case(&self.config.unknown_name))
                .collect()
        } else {
            self.config.identities.clone()
        };

        let mut set = EmbeddingSet::new();
        let mut names = BTreeMap::new();
        let mut stats = ExtractionStats::default();

        for (folder, path) in &folders {
            let label = self.label_for(folder, &enrolled);
            let images = match list_images(path) {
                Ok(images) => images,
                Err(e) => {
                    tracing::warn!(folder = %folder, error = %e, "skipping unreadable dataset folder");
                    continue;
                }
            };
            tracing::info!(folder = %folder, label, images = images.len(), "extracting embeddings");

            let mut kept = 0usize;
            for image_path in images {
                stats.images_seen += 1;
                match self.embed_one(&image_path, &mut stats) {
                    Some(values) => match set.push(values, label) {
                        Ok(()) => kept += 1,
                        Err(e) => {
                            stats.failed += 1;
                            tracing::warn!(path = %image_path.display(), error = %e, "embedding rejected");
                        }
                    },
                    None => continue,
                }
            }

            if kept > 0 {
                let name = if label == UNKNOWN_LABEL {
                    self.config.unknown_name.clone()
                } else {
                    folder.clone()
                };
                names.entry(label).or_insert(name);
            }
            stats.per_folder.insert(folder.clone(), kept);
        }

        stats.embedded = set.len();
        tracing::info!(
            embedded = stats.embedded,
            images = stats.images_seen,
            no_face = stats.no_face,
            failed = stats.failed,
            "dataset extraction finished"
        );
        Ok(Extraction { set, names, stats })
    }

    fn embed_one(&mut self, path: &Path, stats: &mut ExtractionStats) -> Option<Vec<f32>> {
        let faces = match load_image(path).and_then(|img| self.source.detect_and_embed(&img)) {
            Ok(faces) => faces,
            Err(e) => {
                stats.failed += 1;
                tracing::warn!(path = %path.display(), error = %e, "failed to process training image");
                return None;
            }
        };

        if faces.is_empty() {
            stats.no_face += 1;
            tracing::debug!(path = %path.display(), "no face in training image");
            return None;
        }
        if faces.len() > 1 {
            stats.multi_face += 1;
        }
        match self.config.multi_face.pick(&faces) {
            Some(face) => Some(face.embedding.values.clone()),
            None => {
                stats.rejected += 1;
                tracing::debug!(path = %path.display(), faces = faces.len(), "multi-face image rejected");
                None
            }
        }
    }

    /// Per-label mean of the embeddings, accumulated in f64 in row order.
    pub fn fit_centroids(set: &EmbeddingSet) -> BTreeMap<Label, Vec<f32>> {
        let mut sums: BTreeMap<Label, (Vec<f64>, usize)> = BTreeMap::new();
        for (row, &label) in set.rows.iter().zip(&set.labels) {
            let (sum, count) = sums
                .entry(label)
                .or_insert_with(|| (vec![0.0; set.dim], 0));
            for (acc, &v) in sum.iter_mut().zip(row) {
                *acc += v as f64;
            }
            *count += 1;
        }
        sums.into_iter()
            .map(|(label, (sum, count))| {
                let mean = sum.iter().map(|s| (s / count as f64) as f32).collect();
                (label, mean)
            })
            .collect()
    }

    /// Fit the margin model on a stratified split and score the held-out part.
    pub fn fit_margin_classifier(set: &EmbeddingSet, params: &MarginParams) -> Option<MarginFit> {
        let (train, test) = stratified_split(&set.labels, params.test_fraction, params.seed);
        let rows: Vec<&[f32]> = train.iter().map(|&i| set.rows[i].as_slice()).collect();
        let labels: Vec<Label> = train.iter().map(|&i| set.labels[i]).collect();
        let model = MarginModel::fit(&rows, &labels, params)?;
        let evaluation = model.evaluate(&set.rows, &set.labels, &test);
        Some(MarginFit {
            model,
            test_accuracy: evaluation.as_ref().map(|e| e.accuracy),
            per_class: evaluation.map(|e| e.per_class).unwrap_or_default(),
        })
    }

    /// Extract, fit and persist a new generation.
    ///
    /// Fails without touching the store when no embeddings were extracted.
    /// The margin model is only fitted when at least two labels are present.
    pub fn train_full(&mut self, store: &ModelStore) -> Result<TrainingOutcome, TrainingError> {
        let started = Instant::now();
        let Extraction { set, names, stats } = self.build_embeddings()?;
        if set.is_empty() {
            return Err(TrainingError::TrainingDataInsufficient(format!(
                "no faces extracted from {} images in {}",
                stats.images_seen,
                self.config.dataset_dir.display()
            )));
        }

        let centroids = Self::fit_centroids(&set);
        let margin = if set.distinct_labels().len() >= 2 {
            Self::fit_margin_classifier(&set, &self.config.margin)
        } else {
            tracing::warn!("only one label in dataset, skipping margin classifier");
            None
        };
        let test_accuracy = margin.as_ref().and_then(|m| m.test_accuracy);
        if let Some(accuracy) = test_accuracy {
            tracing::info!(accuracy, "margin classifier held-out accuracy");
        }
        let class_metrics: BTreeMap<String, ClassMetrics> = margin
            .iter()
            .flat_map(|m| &m.per_class)
            .filter_map(|(label, metrics)| Some((names.get(label)?.clone(), *metrics)))
            .collect();
        for (name, m) in &class_metrics {
            tracing::info!(
                %name,
                precision = m.precision,
                recall = m.recall,
                support = m.support,
                "held-out scores"
            );
        }

        let embeddings = set.len();
        let snapshot = store.save(TrainedArtifacts {
            embeddings: set,
            centroids,
            names: names.clone(),
            margin: margin.map(|m| m.model),
        })?;

        let report = TrainingReport {
            generation: snapshot.generation().to_string(),
            embeddings,
            classes: snapshot.num_classes(),
            names,
            margin_trained: snapshot.margin().is_some(),
            test_accuracy,
            class_metrics,
            extraction: stats,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            generation = %report.generation,
            embeddings = report.embeddings,
            classes = report.classes,
            elapsed_ms = report.elapsed_ms,
            "training complete"
        );
        Ok(TrainingOutcome { snapshot, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::tests::{solid, ColorSource};
    use crate::types::{Embedding, FaceRegion};

    fn write_image(dir: &Path, name: &str, rgb: [u8; 3]) {
        std::fs::create_dir_all(dir).unwrap();
        solid(rgb).save(dir.join(name)).unwrap();
    }

    fn trainer(dataset: &Path, identities: &[&str]) -> Trainer {
        Trainer::new(
            Box::new(ColorSource),
            TrainingConfig {
                dataset_dir: dataset.to_path_buf(),
                identities: identities.iter().map(|s| s.to_string()).collect(),
                unknown_name: "unknown".into(),
                multi_face: MultiFacePolicy::First,
                margin: MarginParams::default(),
            },
        )
    }

    /// 20 images for alice, 20 for bob, 5 unknown.
    fn populate(dataset: &Path) {
        for i in 0..20u8 {
            write_image(&dataset.join("alice"), &format!("{i:02}.png"), [200 + i, 20, 20]);
            write_image(&dataset.join("bob"), &format!("{i:02}.png"), [20, 200 + i, 20]);
        }
        for i in 0..5u8 {
            write_image(&dataset.join("unknown"), &format!("{i}.png"), [20, 20, 100 + i * 10]);
        }
    }

    fn expected_mean(values: impl Iterator<Item = u8>) -> f32 {
        let v: Vec<f64> = values.map(|c| (c as f32 / 255.0) as f64).collect();
        (v.iter().sum::<f64>() / v.len() as f64) as f32
    }

    #[test]
    fn test_build_embeddings_labels_folders() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        write_image(&dir.path().join("carol"), "0.png", [50, 50, 50]);
        std::fs::write(dir.path().join("alice").join("notes.txt"), b"skip").unwrap();

        let extraction = trainer(dir.path(), &["alice", "bob"]).build_embeddings().unwrap();
        let set = &extraction.set;
        assert_eq!(set.len(), 46);
        assert_eq!(set.count_of(0), 20);
        assert_eq!(set.count_of(1), 20);
        // carol is not enrolled and joins the unknown bucket.
        assert_eq!(set.count_of(UNKNOWN_LABEL), 6);
        assert_eq!(extraction.names[&0], "alice");
        assert_eq!(extraction.names[&1], "bob");
        assert_eq!(extraction.names[&UNKNOWN_LABEL], "unknown");
        assert_eq!(extraction.stats.images_seen, 46);
        assert_eq!(extraction.stats.per_folder["carol"], 1);
    }

    #[test]
    fn test_empty_identities_enroll_every_folder() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("zed"), "a.png", [10, 10, 10]);
        write_image(&dir.path().join("amy"), "a.png", [90, 10, 10]);
        write_image(&dir.path().join("unknown"), "a.png", [10, 90, 10]);
        let extraction = trainer(dir.path(), &[]).build_embeddings().unwrap();
        assert_eq!(extraction.names[&0], "amy");
        assert_eq!(extraction.names[&1], "zed");
        assert_eq!(extraction.names[&UNKNOWN_LABEL], "unknown");
    }

    #[test]
    fn test_faceless_and_broken_images_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("alice"), "face.png", [200, 10, 10]);
        write_image(&dir.path().join("alice"), "blank.png", [0, 0, 0]);
        std::fs::write(dir.path().join("alice").join("broken.jpg"), b"nope").unwrap();

        let extraction = trainer(dir.path(), &["alice"]).build_embeddings().unwrap();
        assert_eq!(extraction.set.len(), 1);
        assert_eq!(extraction.stats.no_face, 1);
        assert_eq!(extraction.stats.failed, 1);
        assert_eq!(extraction.stats.images_seen, 3);
    }

    #[test]
    fn test_centroids_are_exact_means() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let extraction = trainer(dir.path(), &["alice", "bob"]).build_embeddings().unwrap();
        let centroids = Trainer::fit_centroids(&extraction.set);

        assert_eq!(centroids.len(), 3);
        let alice = &centroids[&0];
        assert!((alice[0] - expected_mean(200..220)).abs() < 1e-6);
        assert!((alice[1] - 20.0 / 255.0).abs() < 1e-6);
        let unknown = &centroids[&UNKNOWN_LABEL];
        assert!((unknown[2] - expected_mean((0..5).map(|i| 100 + i * 10))).abs() < 1e-6);
    }

    #[test]
    fn test_fit_centroids_is_bit_identical() {
        let mut set = EmbeddingSet::new();
        for i in 0..50 {
            let x = (i as f32 * 0.731).sin();
            set.push(vec![x, x * 0.5, 1.0 - x], i % 3).unwrap();
        }
        let a = Trainer::fit_centroids(&set);
        let b = Trainer::fit_centroids(&set);
        for (label, centroid) in &a {
            let bits = |v: &[f32]| v.iter().map(|f| f.to_bits()).collect::<Vec<_>>();
            assert_eq!(bits(centroid), bits(&b[label]));
        }
    }

    #[test]
    fn test_train_full_persists_generation() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("dataset");
        populate(&dataset);
        let store = ModelStore::new(dir.path().join("models"));

        let outcome = trainer(&dataset, &["alice", "bob"]).train_full(&store).unwrap();
        assert_eq!(outcome.report.embeddings, 45);
        assert_eq!(outcome.report.classes, 3);
        assert!(outcome.report.margin_trained);
        assert!(outcome.report.test_accuracy.is_some());
        let scored: Vec<&str> = outcome.report.class_metrics.keys().map(String::as_str).collect();
        assert_eq!(scored, vec!["alice", "bob", "unknown"]);
        assert!(outcome.report.class_metrics.values().all(|m| m.support > 0));
        assert_eq!(store.load().unwrap(), outcome.snapshot);
    }

    #[test]
    fn test_retrain_yields_identical_centroids() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("dataset");
        populate(&dataset);
        let store = ModelStore::new(dir.path().join("models"));

        let first = trainer(&dataset, &["alice", "bob"]).train_full(&store).unwrap();
        let second = trainer(&dataset, &["alice", "bob"]).train_full(&store).unwrap();
        assert_ne!(first.snapshot.generation(), second.snapshot.generation());
        assert_eq!(first.snapshot.centroids(), second.snapshot.centroids());
        assert_eq!(first.snapshot.margin(), second.snapshot.margin());
    }

    #[test]
    fn test_single_label_skips_margin() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("dataset");
        write_image(&dataset.join("alice"), "a.png", [200, 10, 10]);
        write_image(&dataset.join("alice"), "b.png", [210, 10, 10]);
        let store = ModelStore::new(dir.path().join("models"));

        let outcome = trainer(&dataset, &["alice"]).train_full(&store).unwrap();
        assert!(!outcome.report.margin_trained);
        assert_eq!(outcome.snapshot.num_classes(), 1);
    }

    #[test]
    fn test_no_faces_is_insufficient_and_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("dataset");
        write_image(&dataset.join("alice"), "blank.png", [0, 0, 0]);
        let store = ModelStore::new(dir.path().join("models"));

        let err = trainer(&dataset, &["alice"]).train_full(&store).unwrap_err();
        assert!(matches!(err, TrainingError::TrainingDataInsufficient(_)));
        assert!(store.current_generation().unwrap().is_none());
    }

    #[test]
    fn test_missing_dataset_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = trainer(&dir.path().join("nope"), &[]).build_embeddings().unwrap_err();
        assert!(matches!(err, TrainingError::Io { .. }));
    }

    #[test]
    fn test_multi_face_policies() {
        let face = |w: i32, tag: f32| DetectedFace {
            region: FaceRegion { top: 0, right: w, bottom: w, left: 0 },
            embedding: Embedding::new(vec![tag]),
            score: 0.9,
        };
        let faces = vec![face(10, 1.0), face(30, 2.0), face(30, 3.0)];
        let pick = |p: MultiFacePolicy| p.pick(&faces).map(|f| f.embedding.values[0]);
        assert_eq!(pick(MultiFacePolicy::First), Some(1.0));
        assert_eq!(pick(MultiFacePolicy::Largest), Some(2.0));
        assert_eq!(pick(MultiFacePolicy::Reject), None);
        assert_eq!(MultiFacePolicy::Reject.pick(&faces[..1]).map(|f| f.score), Some(0.9));
        assert_eq!("LARGEST".parse::<MultiFacePolicy>(), Ok(MultiFacePolicy::Largest));
    }
}
