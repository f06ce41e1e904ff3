//! On-disk model generations.
//!
//! ```text
//! <root>/CURRENT                      id of the active generation
//! <root>/generations/<id>/embeddings.bin
//! <root>/generations/<id>/centroids.bin
//! <root>/generations/<id>/classifier.bin   (only when a margin model was trained)
//! ```
//!
//! A save writes and syncs a complete new generation directory first and
//! only then replaces `CURRENT` through a uniquely named temp file and
//! rename, so readers see either the old generation or the new one. Saves
//! from different processes are serialized by an advisory lock on
//! `<root>/LOCK`.

use crate::margin::MarginModel;
use crate::snapshot::{ModelSnapshot, SnapshotError};
use crate::types::{EmbeddingSet, Label};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const FORMAT_VERSION: u16 = 1;
const CURRENT_FILE: &str = "CURRENT";
const LOCK_FILE: &str = "LOCK";
const GENERATIONS_DIR: &str = "generations";
const EMBEDDINGS_FILE: &str = "embeddings.bin";
const CENTROIDS_FILE: &str = "centroids.bin";
const CLASSIFIER_FILE: &str = "classifier.bin";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no trained model in {0}")]
    NotFound(PathBuf),
    #[error("corrupt model file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("failed to persist model to {path}: {source}")]
    PersistFailure {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("refusing to save inconsistent model: {0}")]
    Invalid(#[from] SnapshotError),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Versioned wrapper around every blob.
#[derive(Serialize, Deserialize)]
struct Blob<T> {
    format: u16,
    body: T,
}

#[derive(Serialize, Deserialize)]
struct CentroidTable {
    centroids: BTreeMap<Label, Vec<f32>>,
    names: BTreeMap<Label, String>,
}

/// Everything one training run produces.
#[derive(Debug, Clone)]
pub struct TrainedArtifacts {
    pub embeddings: EmbeddingSet,
    pub centroids: BTreeMap<Label, Vec<f32>>,
    pub names: BTreeMap<Label, String>,
    pub margin: Option<MarginModel>,
}

pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generation_dir(&self, id: &str) -> PathBuf {
        self.root.join(GENERATIONS_DIR).join(id)
    }

    /// Id of the active generation, if any.
    pub fn current_generation(&self) -> Result<Option<String>, StoreError> {
        let path = self.root.join(CURRENT_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let id = raw.trim();
                if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
                    return Err(StoreError::Corrupt {
                        path,
                        reason: format!("bad generation id {id:?}"),
                    });
                }
                Ok(Some(id.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    /// Generation ids present on disk, sorted.
    pub fn generations(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join(GENERATIONS_DIR);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };
        let mut ids: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Load the active generation.
    pub fn load(&self) -> Result<ModelSnapshot, StoreError> {
        let _lock = self.read_lock();
        let id = self
            .current_generation()?
            .ok_or_else(|| StoreError::NotFound(self.root.clone()))?;
        let dir = self.generation_dir(&id);

        let table_path = dir.join(CENTROIDS_FILE);
        let table: CentroidTable = read_blob(&table_path)?;
        let classifier_path = dir.join(CLASSIFIER_FILE);
        let margin: Option<MarginModel> = if classifier_path.exists() {
            Some(read_blob(&classifier_path)?)
        } else {
            None
        };

        let snapshot = ModelSnapshot::new(id.as_str(), table.centroids, table.names, margin)
            .map_err(|e| StoreError::Corrupt {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(
            generation = %id,
            classes = snapshot.num_classes(),
            dim = snapshot.dim(),
            margin = snapshot.margin().is_some(),
            "model snapshot loaded"
        );
        Ok(snapshot)
    }

    /// Training embeddings of the active generation.
    pub fn load_embeddings(&self) -> Result<EmbeddingSet, StoreError> {
        let _lock = self.read_lock();
        let id = self
            .current_generation()?
            .ok_or_else(|| StoreError::NotFound(self.root.clone()))?;
        read_blob(&self.generation_dir(&id).join(EMBEDDINGS_FILE))
    }

    /// Persist `artifacts` as a new generation and make it current.
    ///
    /// Returns the snapshot of the new generation. On failure the previous
    /// generation stays current.
    pub fn save(&self, artifacts: TrainedArtifacts) -> Result<ModelSnapshot, StoreError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let snapshot = ModelSnapshot::new(
            id.as_str(),
            artifacts.centroids,
            artifacts.names,
            artifacts.margin,
        )?;

        let _lock = self.lock()?;
        let previous = self.current_generation().ok().flatten();

        let dir = self.generation_dir(&id);
        if let Err(e) = self.write_generation(&dir, &artifacts.embeddings, &snapshot) {
            let _ = std::fs::remove_dir_all(&dir);
            return Err(e);
        }
        if let Err(e) = self.swap_current(&id) {
            let _ = std::fs::remove_dir_all(&dir);
            return Err(e);
        }

        tracing::info!(
            generation = %id,
            previous = previous.as_deref().unwrap_or("-"),
            embeddings = artifacts.embeddings.len(),
            classes = snapshot.num_classes(),
            "model generation saved"
        );
        self.prune(previous.as_deref());
        Ok(snapshot)
    }

    /// Shared lock so a concurrent save cannot prune the generation being
    /// read. Reads go ahead unlocked when the lock file cannot be opened.
    fn read_lock(&self) -> Option<File> {
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.root.join(LOCK_FILE))
            .ok()?;
        file.lock_shared().ok()?;
        Some(file)
    }

    /// Exclusive lock held for the whole of a save. Released on drop.
    fn lock(&self) -> Result<File, StoreError> {
        let path = self.root.join(LOCK_FILE);
        let persist = |source| StoreError::PersistFailure {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(&self.root).map_err(persist)?;
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(persist)?;
        file.lock_exclusive().map_err(persist)?;
        Ok(file)
    }

    fn write_generation(
        &self,
        dir: &Path,
        embeddings: &EmbeddingSet,
        snapshot: &ModelSnapshot,
    ) -> Result<(), StoreError> {
        std::fs::create_dir_all(dir).map_err(|source| StoreError::PersistFailure {
            path: dir.to_path_buf(),
            source,
        })?;
        write_blob(&dir.join(EMBEDDINGS_FILE), embeddings)?;
        let table = CentroidTable {
            centroids: snapshot.centroids().clone(),
            names: snapshot.names().clone(),
        };
        write_blob(&dir.join(CENTROIDS_FILE), &table)?;
        if let Some(model) = snapshot.margin() {
            write_blob(&dir.join(CLASSIFIER_FILE), model)?;
        }
        sync_dir(dir)
    }

    fn swap_current(&self, id: &str) -> Result<(), StoreError> {
        let tmp = self.root.join(format!("{CURRENT_FILE}.{id}.tmp"));
        let target = self.root.join(CURRENT_FILE);
        let persist = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::PersistFailure { path, source }
        };
        let written = write_synced(&tmp, format!("{id}\n").as_bytes())
            .map_err(persist(&tmp))
            .and_then(|()| std::fs::rename(&tmp, &target).map_err(persist(&target)));
        if written.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        written?;
        sync_dir(&self.root)
    }

    /// Remove every generation except the current one and `previous`.
    /// Best-effort; called with the lock held.
    fn prune(&self, previous: Option<&str>) {
        let Ok(Some(current)) = self.current_generation() else {
            return;
        };
        let Ok(ids) = self.generations() else {
            return;
        };
        for id in ids {
            if id == current || Some(id.as_str()) == previous {
                continue;
            }
            let dir = self.generation_dir(&id);
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => tracing::debug!(generation = %id, "pruned old generation"),
                Err(e) => tracing::warn!(generation = %id, error = %e, "failed to prune generation"),
            }
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|source| StoreError::PersistFailure {
            path: dir.to_path_buf(),
            source,
        })
}

fn write_blob<T: Serialize>(path: &Path, body: &T) -> Result<(), StoreError> {
    let blob = Blob {
        format: FORMAT_VERSION,
        body,
    };
    let persist = |source: std::io::Error| StoreError::PersistFailure {
        path: path.to_path_buf(),
        source,
    };
    let bytes = postcard::to_allocvec(&blob)
        .map_err(|e| persist(std::io::Error::other(e.to_string())))?;
    write_synced(path, &bytes).map_err(persist)
}

fn read_blob<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = std::fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: "file missing from generation".into(),
            }
        } else {
            StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    let blob: Blob<T> = postcard::from_bytes(&bytes).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if blob.format != FORMAT_VERSION {
        return Err(StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("unsupported format version {}", blob.format),
        });
    }
    Ok(blob.body)
}
