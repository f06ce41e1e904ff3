use anyhow::{Context, Result};
use facewatch_core::{
    ArcCell, Config, ModelStore, OnnxEmbedder, Recognizer, SnapshotCell, StoreError, Trainer,
    TrainingConfig,
};
use facewatch_hw::Camera;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

mod pipeline;
mod training;
mod watcher;

#[cfg(test)]
mod testing;

use pipeline::{FramePipeline, HandOffReceiver, PipelineSettings};
use watcher::{UploadWatcher, WatcherSettings};

fn load_source(config: &Config) -> Result<Box<OnnxEmbedder>> {
    let source = OnnxEmbedder::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .with_context(|| format!("loading ONNX models from {}", config.onnx_dir.display()))?;
    Ok(Box::new(source))
}

/// Log what the capture thread hands off. Stands in for a display.
async fn consume_handoffs(mut rx: HandOffReceiver) {
    let mut last_logged = 0u64;
    while rx.changed().await.is_ok() {
        let latest = rx.borrow_and_update().clone();
        let Some(handoff) = latest else { continue };
        if !handoff.fresh || handoff.frame_number == last_logged {
            continue;
        }
        last_logged = handoff.frame_number;
        let names: Vec<&str> = handoff.results.iter().map(|r| r.name.as_str()).collect();
        tracing::debug!(
            frame = handoff.frame_number,
            width = handoff.frame.width(),
            height = handoff.frame.height(),
            faces = ?names,
            counts = ?handoff.counts,
            "frame recognized"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facewatchd starting");

    let config = Config::from_env().context("loading configuration")?;
    config
        .ensure_layout()
        .with_context(|| format!("creating data layout under {}", config.data_dir.display()))?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        threshold = config.threshold,
        classifier = ?config.classifier,
        "configuration loaded"
    );

    let store = ModelStore::new(config.models_dir());
    let initial = match store.load() {
        Ok(snapshot) => Some(snapshot),
        Err(StoreError::NotFound(path)) => {
            tracing::warn!(path = %path.display(), "no trained model yet, faces will be unlabeled");
            None
        }
        Err(e) => return Err(e).context("loading model snapshot"),
    };
    let snapshot = Arc::new(SnapshotCell::new(initial));
    let recognition = Arc::new(ArcCell::new(config.recognition()));

    let trainer = Trainer::new(load_source(&config)?, TrainingConfig::from_config(&config));
    let training = training::spawn_trainer(trainer, store, Arc::clone(&snapshot))
        .context("failed to spawn training thread")?;

    let watcher_recognizer =
        Recognizer::new(load_source(&config)?, Arc::clone(&snapshot), Arc::clone(&recognition));
    let mut watcher = UploadWatcher::new(
        WatcherSettings::from_config(&config),
        watcher_recognizer,
        config.auto_process,
    )
    .spawn()
    .context("failed to spawn upload watcher")?;

    let pipeline_recognizer =
        Recognizer::new(load_source(&config)?, Arc::clone(&snapshot), Arc::clone(&recognition));
    let mut pipeline =
        FramePipeline::new(PipelineSettings::from_config(&config), pipeline_recognizer);
    let consumer = tokio::spawn(consume_handoffs(pipeline.subscribe()));
    if config.camera_enabled {
        let index = config.camera_index;
        match pipeline.start(|| Camera::open_index(index)) {
            Ok(()) => tracing::info!(camera = index, state = ?pipeline.state(), "live capture started"),
            Err(e) => tracing::error!(error = %e, "live capture disabled"),
        }
    } else {
        tracing::info!("camera disabled via FACEWATCH_CAMERA_ENABLED=0");
    }

    tracing::info!("facewatchd ready");

    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut usr1 = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;
    let mut auto_process = config.auto_process;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = hangup.recv() => {
                tracing::info!(busy = training.is_busy(), "SIGHUP received, retraining");
                let training = training.clone();
                tokio::spawn(async move {
                    match training.retrain().await {
                        Ok(report) => tracing::info!(
                            generation = %report.generation,
                            classes = report.classes,
                            "retrain finished"
                        ),
                        Err(e) => tracing::warn!(error = %e, "retrain not applied"),
                    }
                });
            }
            _ = usr1.recv() => {
                auto_process = !auto_process;
                watcher.set_auto_process(auto_process);
            }
        }
    }

    tracing::info!("facewatchd shutting down");
    if let Some(stats) = pipeline.stop() {
        tracing::info!(
            frames = stats.frames,
            recognized = stats.recognized_frames,
            failed = stats.failed_frames,
            "capture summary"
        );
    }
    drop(pipeline);
    consumer.abort();
    watcher.stop();

    Ok(())
}
