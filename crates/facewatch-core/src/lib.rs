//! facewatch-core: Face identification engine.
//!
//! Turns face embeddings into labeled, confidence-scored identities using
//! per-person centroids or a trained margin classifier, and owns the
//! training pipeline and the on-disk model snapshots it produces.

pub mod batch;
pub mod cell;
pub mod classifier;
pub mod config;
pub mod detector;
pub mod embedder;
pub mod margin;
pub mod recognizer;
pub mod schedule;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod trainer;
pub mod types;

pub use cell::ArcCell;
pub use classifier::{Classifier, ClassifierKind, ClassifyError, Decision};
pub use config::{update_threshold, Config, ConfigError, RecognitionConfig};
pub use embedder::OnnxEmbedder;
pub use recognizer::Recognizer;
pub use snapshot::{ModelSnapshot, SnapshotCell};
pub use source::{EmbeddingSource, SourceError};
pub use store::{ModelStore, StoreError, TrainedArtifacts};
pub use trainer::{
    MultiFacePolicy, Trainer, TrainingConfig, TrainingError, TrainingOutcome, TrainingReport,
};
pub use types::{
    DetectedFace, Embedding, EmbeddingSet, FaceRegion, Identity, Label, RecognitionResult,
    UNKNOWN_LABEL,
};
