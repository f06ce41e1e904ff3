//! Upload directory watcher.
//!
//! Polls the uploads directory, recognizes each new image once and moves it
//! into the archive, prefixed `processed_` or `failed_`. Only files that could
//! not be moved are remembered, and only while they remain in the uploads
//! directory, so a later upload under the same name is handled again.

use facewatch_core::batch::{process_image, FileOutcome};
use facewatch_core::source::list_images;
use facewatch_core::{Config, Recognizer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub uploads_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub poll_interval: Duration,
}

impl WatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            uploads_dir: config.uploads_dir(),
            archive_dir: config.archive_dir(),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
        }
    }
}

/// Result of one scan of the uploads directory.
#[derive(Debug, Default)]
pub struct PollReport {
    /// Image files present in the uploads directory.
    pub scanned: usize,
    /// Files not seen before this poll.
    pub new_files: usize,
    pub outcomes: Vec<FileOutcome>,
    pub archived: usize,
    pub archive_failures: usize,
}

pub struct UploadWatcher {
    settings: WatcherSettings,
    recognizer: Recognizer,
    /// Handled files that are still in the uploads directory.
    processed: HashSet<PathBuf>,
    auto_process: Arc<AtomicBool>,
}

impl UploadWatcher {
    pub fn new(settings: WatcherSettings, recognizer: Recognizer, auto_process: bool) -> Self {
        Self {
            settings,
            recognizer,
            processed: HashSet::new(),
            auto_process: Arc::new(AtomicBool::new(auto_process)),
        }
    }

    #[cfg(test)]
    pub fn auto_process(&self) -> &Arc<AtomicBool> {
        &self.auto_process
    }

    #[cfg(test)]
    pub fn is_processed(&self, path: &Path) -> bool {
        self.processed.contains(&absolute(path))
    }

    /// Scan once and handle every image not processed before.
    pub fn poll_once(&mut self) -> std::io::Result<PollReport> {
        let images: Vec<PathBuf> = list_images(&self.settings.uploads_dir)?
            .iter()
            .map(|p| absolute(p))
            .collect();
        let present: HashSet<&PathBuf> = images.iter().collect();
        self.processed.retain(|p| present.contains(p));
        let fresh: Vec<PathBuf> = images
            .iter()
            .filter(|p| !self.processed.contains(*p))
            .cloned()
            .collect();

        let mut report = PollReport {
            scanned: images.len(),
            new_files: fresh.len(),
            ..PollReport::default()
        };
        if !self.auto_process.load(Ordering::SeqCst) {
            if !fresh.is_empty() {
                tracing::debug!(pending = fresh.len(), "auto-processing disabled, leaving uploads");
            }
            return Ok(report);
        }

        for path in fresh {
            let outcome = process_image(&mut self.recognizer, &path);
            tracing::info!(file = %path.display(), "{}", outcome.summary());

            let prefix = if outcome.is_ok() { "processed" } else { "failed" };
            match self.archive(&path, prefix) {
                Ok(dest) => {
                    tracing::debug!(from = %path.display(), to = %dest.display(), "archived upload");
                    report.archived += 1;
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "failed to archive upload");
                    report.archive_failures += 1;
                    self.processed.insert(path);
                }
            }
            report.outcomes.push(outcome);
        }
        Ok(report)
    }

    fn archive(&self, path: &Path, prefix: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.settings.archive_dir)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dest = self.settings.archive_dir.join(archive_name(prefix, &name, chrono::Local::now()));
        std::fs::rename(path, &dest)?;
        Ok(dest)
    }

    /// Run the poll loop on a dedicated thread.
    pub fn spawn(mut self) -> std::io::Result<WatcherHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let auto_process = Arc::clone(&self.auto_process);
        let interval = self.settings.poll_interval;
        let thread_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("facewatch-watcher".into())
            .spawn(move || {
                tracing::info!(dir = %self.settings.uploads_dir.display(), "upload watcher started");
                while !thread_stop.load(Ordering::SeqCst) {
                    match self.poll_once() {
                        Ok(report) if report.new_files > 0 => tracing::info!(
                            scanned = report.scanned,
                            new = report.new_files,
                            archived = report.archived,
                            "upload poll"
                        ),
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "failed to scan uploads"),
                    }
                    std::thread::park_timeout(interval);
                }
                tracing::info!("upload watcher stopped");
            })?;

        Ok(WatcherHandle {
            stop,
            auto_process,
            thread: Some(thread),
        })
    }
}

pub struct WatcherHandle {
    stop: Arc<AtomicBool>,
    auto_process: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn set_auto_process(&self, enabled: bool) {
        self.auto_process.store(enabled, Ordering::SeqCst);
        tracing::info!(enabled, "auto-processing toggled");
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                tracing::error!("upload watcher thread panicked");
            }
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn archive_name(prefix: &str, name: &str, at: chrono::DateTime<chrono::Local>) -> String {
    format!("{prefix}_{}_{name}", at.format("%Y%m%d_%H%M%S"))
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{recognizer, solid};
    use chrono::TimeZone;

    fn setup(auto: bool) -> (tempfile::TempDir, UploadWatcher) {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        let settings = WatcherSettings {
            archive_dir: uploads.join("processed"),
            uploads_dir: uploads,
            poll_interval: Duration::from_millis(10),
        };
        (dir, UploadWatcher::new(settings, recognizer(), auto))
    }

    #[test]
    fn test_archive_name_format() {
        let at = chrono::Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(archive_name("processed", "a.jpg", at), "processed_20240309_140507_a.jpg");
        assert_eq!(archive_name("failed", "b.png", at), "failed_20240309_140507_b.png");
    }

    #[test]
    fn test_poll_recognizes_and_archives() {
        let (dir, mut watcher) = setup(true);
        let uploads = dir.path().join("uploads");
        solid([255, 255, 255]).save(uploads.join("alice.png")).unwrap();
        solid([0, 0, 0]).save(uploads.join("empty.png")).unwrap();
        std::fs::write(uploads.join("notes.txt"), "x").unwrap();

        let report = watcher.poll_once().unwrap();
        assert_eq!((report.scanned, report.new_files, report.archived), (2, 2, 2));
        assert_eq!(report.outcomes[0].results[0].name, "alice");
        assert_eq!(report.outcomes[1].summary(), "no faces found");

        let archived = list_images(&uploads.join("processed")).unwrap();
        assert_eq!(archived.len(), 2);
        let name = archived[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("processed_") && name.ends_with("_alice.png"));
        assert!(list_images(&uploads).unwrap().is_empty());
    }

    #[test]
    fn test_failed_move_is_not_reprocessed() {
        let (dir, mut watcher) = setup(true);
        let uploads = dir.path().join("uploads");
        // A plain file where the archive directory should be.
        std::fs::write(uploads.join("processed"), "").unwrap();
        let image = uploads.join("alice.png");
        solid([255, 255, 255]).save(&image).unwrap();

        let first = watcher.poll_once().unwrap();
        assert_eq!((first.new_files, first.archived, first.archive_failures), (1, 0, 1));
        assert!(image.exists());
        assert!(watcher.is_processed(&image));

        let second = watcher.poll_once().unwrap();
        assert_eq!((second.scanned, second.new_files), (1, 0));
        assert!(second.outcomes.is_empty());
    }

    #[test]
    fn test_auto_process_off_only_counts() {
        let (dir, mut watcher) = setup(false);
        let uploads = dir.path().join("uploads");
        let image = uploads.join("alice.png");
        solid([255, 255, 255]).save(&image).unwrap();

        let report = watcher.poll_once().unwrap();
        assert_eq!((report.scanned, report.new_files), (1, 1));
        assert!(report.outcomes.is_empty());
        assert!(image.exists());
        assert!(!watcher.is_processed(&image));

        watcher.auto_process().store(true, Ordering::SeqCst);
        assert_eq!(watcher.poll_once().unwrap().archived, 1);
    }

    #[test]
    fn test_spawned_watcher_stops() {
        let (dir, watcher) = setup(true);
        let uploads = dir.path().join("uploads");
        solid([255, 255, 255]).save(uploads.join("alice.png")).unwrap();

        let mut handle = watcher.spawn().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while uploads.join("alice.png").exists() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.stop();
        assert!(!uploads.join("alice.png").exists());
        assert_eq!(list_images(&uploads.join("processed")).unwrap().len(), 1);
    }

    #[test]
    fn test_reupload_with_same_name_is_processed() {
        let (dir, mut watcher) = setup(true);
        let uploads = dir.path().join("uploads");
        let image = uploads.join("a.png");
        solid([255, 255, 255]).save(&image).unwrap();
        assert_eq!(watcher.poll_once().unwrap().archived, 1);
        assert!(!image.exists());

        solid([0, 0, 0]).save(&image).unwrap();
        let report = watcher.poll_once().unwrap();
        assert_eq!((report.new_files, report.archived), (1, 1));
        assert_eq!(report.outcomes[0].summary(), "no faces found");
        assert!(!image.exists());
        assert!(watcher.processed.is_empty());
    }

    #[test]
    fn test_unreadable_upload_archived_as_failed() {
        let (dir, mut watcher) = setup(true);
        let uploads = dir.path().join("uploads");
        std::fs::write(uploads.join("broken.jpg"), b"not an image").unwrap();
        solid([255, 255, 255]).save(uploads.join("alice.png")).unwrap();

        let report = watcher.poll_once().unwrap();
        assert_eq!(report.archived, 2);
        let mut names: Vec<String> = list_images(&uploads.join("processed"))
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert!(names[0].starts_with("failed_") && names[0].ends_with("_broken.jpg"));
        assert!(names[1].starts_with("processed_") && names[1].ends_with("_alice.png"));
    }

    #[test]
    fn test_unmovable_file_forgotten_once_removed() {
        let (dir, mut watcher) = setup(true);
        let uploads = dir.path().join("uploads");
        std::fs::write(uploads.join("processed"), "").unwrap();
        let image = uploads.join("alice.png");
        solid([255, 255, 255]).save(&image).unwrap();

        watcher.poll_once().unwrap();
        assert!(watcher.is_processed(&image));
        std::fs::remove_file(&image).unwrap();
        watcher.poll_once().unwrap();
        assert!(!watcher.is_processed(&image));
    }
}
