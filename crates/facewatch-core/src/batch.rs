//! Recognition over single files and whole directories.

use crate::recognizer::Recognizer;
use crate::source::{list_images, SourceError};
use crate::types::RecognitionResult;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Per-file result. Failures are carried as data so one bad file never
/// aborts a batch.
#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub results: Vec<RecognitionResult>,
    pub error: Option<String>,
}

impl FileOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Names of the recognized faces, or "no faces found".
    pub fn summary(&self) -> String {
        if let Some(error) = &self.error {
            return format!("error: {error}");
        }
        if self.results.is_empty() {
            return "no faces found".to_string();
        }
        self.results
            .iter()
            .map(|r| format!("{} ({:.2})", r.name, r.confidence))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStats {
    pub total_images: usize,
    pub processed: usize,
    pub failed: usize,
    pub faces_found: usize,
    /// Face count per resolved name.
    pub recognitions: BTreeMap<String, usize>,
}

impl BatchStats {
    pub fn record(&mut self, outcome: &FileOutcome) {
        if !outcome.is_ok() {
            self.failed += 1;
            return;
        }
        self.processed += 1;
        self.faces_found += outcome.results.len();
        for result in &outcome.results {
            *self.recognitions.entry(result.name.clone()).or_default() += 1;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub stats: BatchStats,
    pub files: Vec<FileOutcome>,
}

pub fn process_image(recognizer: &mut Recognizer, path: &Path) -> FileOutcome {
    match recognizer.recognize_file(path) {
        Ok(results) => FileOutcome {
            path: path.to_path_buf(),
            results,
            error: None,
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to process image");
            FileOutcome {
                path: path.to_path_buf(),
                results: Vec::new(),
                error: Some(e.to_string()),
            }
        }
    }
}

/// Recognize every image directly inside `dir`, in path order.
pub fn process_directory(recognizer: &mut Recognizer, dir: &Path) -> Result<BatchReport, SourceError> {
    let images = list_images(dir)?;
    let mut report = BatchReport {
        stats: BatchStats {
            total_images: images.len(),
            ..BatchStats::default()
        },
        files: Vec::with_capacity(images.len()),
    };
    tracing::info!(dir = %dir.display(), images = images.len(), "processing directory");

    for (i, path) in images.iter().enumerate() {
        let outcome = process_image(recognizer, path);
        tracing::info!(
            n = i + 1,
            of = images.len(),
            file = %path.display(),
            "{}",
            outcome.summary()
        );
        report.stats.record(&outcome);
        report.files.push(outcome);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::ArcCell;
    use crate::config::RecognitionConfig;
    use crate::recognizer::tests::{solid, ColorSource};
    use crate::snapshot::{ModelSnapshot, SnapshotCell};
    use std::sync::Arc;

    fn recognizer() -> Recognizer {
        let snap = ModelSnapshot::new(
            "g",
            BTreeMap::from([(0, vec![1.0, 1.0, 1.0])]),
            BTreeMap::from([(0, "alice".to_string())]),
            None,
        )
        .unwrap();
        Recognizer::new(
            Box::new(ColorSource),
            Arc::new(SnapshotCell::new(Some(snap))),
            Arc::new(ArcCell::new(RecognitionConfig::default())),
        )
    }

    #[test]
    fn test_process_directory_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        solid([255, 255, 255]).save(dir.path().join("a.png")).unwrap();
        solid([10, 10, 10]).save(dir.path().join("b.png")).unwrap();
        solid([0, 0, 0]).save(dir.path().join("c.png")).unwrap();
        std::fs::write(dir.path().join("d.jpg"), b"broken").unwrap();
        std::fs::write(dir.path().join("readme.md"), b"ignored").unwrap();

        let report = process_directory(&mut recognizer(), dir.path()).unwrap();
        let stats = &report.stats;
        assert_eq!(stats.total_images, 4);
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.faces_found, 2);
        assert_eq!(stats.recognitions["alice"], 1);
        assert_eq!(stats.recognitions["unknown"], 1);
        assert_eq!(report.files[2].summary(), "no faces found");
        assert!(report.files[3].summary().starts_with("error:"));
    }

    #[test]
    fn test_process_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(process_directory(&mut recognizer(), &dir.path().join("missing")).is_err());
    }
}
