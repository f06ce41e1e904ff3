use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::batch::{process_directory, process_image, BatchReport, BatchStats};
use facewatch_core::source::list_images;
use facewatch_core::{
    update_threshold, ArcCell, ClassifierKind, Config, ModelSnapshot, ModelStore, OnnxEmbedder,
    Recognizer, SnapshotCell, StoreError, Trainer, TrainingConfig,
};
use facewatch_hw::{Camera, VideoFile};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod video;

use video::{process_video, report_name, VideoSettings};

#[derive(Parser)]
#[command(name = "facewatch", about = "facewatch face identification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract embeddings from the dataset and train a new model
    Train {
        /// Print the training report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Recognize faces in an image or every image in a directory
    Recognize {
        /// Image file or directory
        path: PathBuf,
        /// Override the distance threshold for this run
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Decision rule: centroid or margin
        #[arg(short, long)]
        classifier: Option<ClassifierKind>,
        /// Write a JSON report under results/reports
        #[arg(long)]
        report: bool,
    },
    /// Recognize faces in a video file and write a per-frame JSON report
    Video {
        /// Video file readable by ffmpeg
        path: PathBuf,
        /// Recognize every N-th frame instead of the configured value
        #[arg(long)]
        frame_skip: Option<u64>,
    },
    /// Show model, dataset and upload status
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List V4L2 capture devices
    Devices,
}

#[derive(Serialize)]
struct ModelStatus {
    generation: String,
    classes: usize,
    dim: usize,
    names: BTreeMap<i32, String>,
    margin: bool,
}

#[derive(Serialize)]
struct Status {
    data_dir: PathBuf,
    threshold: f32,
    classifier: ClassifierKind,
    model: Option<ModelStatus>,
    generations: Vec<String>,
    dataset: BTreeMap<String, usize>,
    pending_uploads: usize,
}

fn load_source(config: &Config) -> Result<Box<OnnxEmbedder>> {
    let source = OnnxEmbedder::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .with_context(|| format!("loading ONNX models from {}", config.onnx_dir.display()))?;
    Ok(Box::new(source))
}

fn train(config: &Config, json: bool) -> Result<()> {
    let store = ModelStore::new(config.models_dir());
    let mut trainer = Trainer::new(load_source(config)?, TrainingConfig::from_config(config));
    let outcome = trainer.train_full(&store).context("training failed")?;
    let report = outcome.report;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("Generation:  {}", report.generation);
    println!("Embeddings:  {}", report.embeddings);
    println!("Classes:     {}", report.classes);
    for (label, name) in &report.names {
        let kept = report.extraction.per_folder.get(name).copied().unwrap_or(0);
        println!("  {label:>3}  {name} ({kept} embeddings)");
    }
    println!(
        "Images:      {} seen, {} without a face, {} with several, {} failed",
        report.extraction.images_seen,
        report.extraction.no_face,
        report.extraction.multi_face,
        report.extraction.failed
    );
    match (report.margin_trained, report.test_accuracy) {
        (true, Some(accuracy)) => println!("Margin:      trained, {:.1}% held-out accuracy", accuracy * 100.0),
        (true, None) => println!("Margin:      trained"),
        (false, _) => println!("Margin:      skipped"),
    }
    for (name, m) in &report.class_metrics {
        println!(
            "  {name}: precision {:.2}, recall {:.2}, f1 {:.2} ({} held out)",
            m.precision, m.recall, m.f1, m.support
        );
    }
    println!("Elapsed:     {} ms", report.elapsed_ms);
    Ok(())
}

fn load_snapshot(config: &Config) -> Result<Option<ModelSnapshot>> {
    match ModelStore::new(config.models_dir()).load() {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(StoreError::NotFound(_)) => {
            eprintln!("No trained model found; run `facewatch train` first. Faces will be unlabeled.");
            Ok(None)
        }
        Err(e) => Err(e).context("loading model snapshot"),
    }
}

fn recognize(
    config: &Config,
    path: &Path,
    threshold: Option<f32>,
    classifier: Option<ClassifierKind>,
    write_report: bool,
) -> Result<()> {
    let snapshot = load_snapshot(config)?;

    let mut recognition = config.recognition();
    if let Some(kind) = classifier {
        recognition.classifier = kind;
    }
    let recognition = Arc::new(ArcCell::new(recognition));
    if let Some(t) = threshold {
        update_threshold(&recognition, t).context("invalid threshold")?;
    }

    let mut recognizer = Recognizer::new(
        load_source(config)?,
        Arc::new(SnapshotCell::new(snapshot)),
        recognition,
    );

    let report = if path.is_dir() {
        process_directory(&mut recognizer, path)
            .with_context(|| format!("processing {}", path.display()))?
    } else if path.is_file() {
        let outcome = process_image(&mut recognizer, path);
        let mut stats = BatchStats {
            total_images: 1,
            ..BatchStats::default()
        };
        stats.record(&outcome);
        BatchReport {
            stats,
            files: vec![outcome],
        }
    } else {
        bail!("{} does not exist", path.display());
    };

    for file in &report.files {
        println!("{}: {}", file.path.display(), file.summary());
    }
    let stats = &report.stats;
    println!(
        "\n{} images, {} processed, {} failed, {} faces",
        stats.total_images, stats.processed, stats.failed, stats.faces_found
    );
    for (name, count) in &stats.recognitions {
        println!("  {name}: {count}");
    }

    if write_report {
        let dir = config.reports_dir();
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let file = dir.join(format!(
            "report_{}.json",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        ));
        let body = serde_json::to_string_pretty(&report)?;
        std::fs::write(&file, body).with_context(|| format!("writing {}", file.display()))?;
        println!("Report written to {}", file.display());
    }
    Ok(())
}

fn video(config: &Config, path: &Path, frame_skip: Option<u64>) -> Result<()> {
    let mut device =
        VideoFile::open(path).with_context(|| format!("opening video {}", path.display()))?;
    let info = device.info().clone();
    println!(
        "Video:       {}x{} at {:.1} fps, {} frames ({})",
        info.width, info.height, info.fps, info.frames, info.codec
    );

    let mut settings = VideoSettings::from_config(config);
    if let Some(n) = frame_skip {
        settings.frame_skip = n.max(1);
    }
    let mut recognizer = Recognizer::new(
        load_source(config)?,
        Arc::new(SnapshotCell::new(load_snapshot(config)?)),
        Arc::new(ArcCell::new(config.recognition())),
    );
    let report = process_video(&mut device, &mut recognizer, &settings, path);

    let stats = &report.stats;
    println!(
        "Frames:      {} decoded, {} recognized, {} failed",
        stats.frames, stats.recognized_frames, stats.failed_frames
    );
    for (name, count) in &stats.counts {
        println!("  {name}: {count}");
    }
    if let Some(error) = &report.error {
        eprintln!("Decoding stopped early: {error}");
    }

    let dir = config.videos_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let file = dir.join(report_name(path, chrono::Local::now()));
    let body = serde_json::to_string_pretty(&report)?;
    std::fs::write(&file, body).with_context(|| format!("writing {}", file.display()))?;
    println!("Report written to {}", file.display());
    Ok(())
}

fn dataset_counts(dataset: &Path) -> Result<BTreeMap<String, usize>> {
    let mut counts = BTreeMap::new();
    let Ok(entries) = std::fs::read_dir(dataset) else {
        return Ok(counts);
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let images = list_images(&entry.path())?;
        counts.insert(entry.file_name().to_string_lossy().into_owned(), images.len());
    }
    Ok(counts)
}

fn status(config: &Config, json: bool) -> Result<()> {
    let store = ModelStore::new(config.models_dir());
    let model = match store.load() {
        Ok(snapshot) => Some(ModelStatus {
            generation: snapshot.generation().to_string(),
            classes: snapshot.num_classes(),
            dim: snapshot.dim(),
            names: snapshot.names().clone(),
            margin: snapshot.margin().is_some(),
        }),
        Err(StoreError::NotFound(_)) => None,
        Err(e) => return Err(e).context("loading model snapshot"),
    };
    let uploads = config.uploads_dir();
    let status = Status {
        data_dir: config.data_dir.clone(),
        threshold: config.threshold,
        classifier: config.classifier,
        model,
        generations: store.generations()?,
        dataset: dataset_counts(&config.dataset_dir())?,
        pending_uploads: if uploads.is_dir() { list_images(&uploads)?.len() } else { 0 },
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    println!("Data dir:    {}", status.data_dir.display());
    println!("Threshold:   {}", status.threshold);
    println!("Classifier:  {:?}", status.classifier);
    match &status.model {
        Some(m) => {
            println!(
                "Model:       {} ({} classes, dim {}, margin {})",
                m.generation,
                m.classes,
                m.dim,
                if m.margin { "yes" } else { "no" }
            );
            for (label, name) in &m.names {
                println!("  {label:>3}  {name}");
            }
        }
        None => println!("Model:       none"),
    }
    println!("Generations: {}", status.generations.len());
    println!("Dataset:");
    for (folder, count) in &status.dataset {
        println!("  {folder}: {count} images");
    }
    println!("Uploads:     {} pending", status.pending_uploads);
    Ok(())
}

fn devices() {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;

    match cli.command {
        Commands::Train { json } => train(&config, json)?,
        Commands::Recognize {
            path,
            threshold,
            classifier,
            report,
        } => recognize(&config, &path, threshold, classifier, report)?,
        Commands::Video { path, frame_skip } => video(&config, &path, frame_skip)?,
        Commands::Status { json } => status(&config, json)?,
        Commands::Devices => devices(),
    }

    Ok(())
}
