// THEORY:
// `ddad_tester` runs the engine over one category of an MVTec-style dataset:
//
//   <data_dir>/<category>/train/good/*.png          normal images for fitting
//   <data_dir>/<category>/test/<defect>/*.png       `good` or a defect type
//   <data_dir>/<category>/ground_truth/<defect>/<stem>_mask.png
//
// It fits (or restores a checkpoint), evaluates the test folder with labels taken
// from the folder names, and writes the `EvaluationReport` as JSON. A defect image
// without its mask is reported as a data failure rather than scored against an
// all-normal mask.

use anyhow::{Context, bail};
use clap::Parser;
use ddad_vision::core_modules::model_state::ModelState;
use ddad_vision::core_modules::tensor::tensor::Tensor3;
use ddad_vision::parallel_pipeline::LoadedImage;
use ddad_vision::{DecodeSettings, InspectConfig, InspectionPipeline, LoaderPool};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

#[derive(Parser, Debug)]
#[command(name = "ddad_tester", about = "Fit and evaluate ddad_vision on an MVTec-style category")]
struct Args {
    /// JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Overrides `data.data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Overrides `data.category`.
    #[arg(long)]
    category: Option<String>,

    /// Overrides `model.seed`.
    #[arg(long, allow_negative_numbers = true)]
    seed: Option<i64>,

    /// Restore this model state instead of fitting.
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Where to write the report. Defaults to `<category>_report.json`.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// Where the pixel labels of one test image come from.
#[derive(Debug, Clone, PartialEq)]
enum PixelTruth {
    /// `good` images: every pixel is normal.
    Normal,
    Mask(PathBuf),
    /// Defect image whose mask file does not exist.
    Missing(PathBuf),
}

struct TestEntry {
    path: PathBuf,
    anomalous: bool,
    truth: PixelTruth,
}

impl TestEntry {
    fn mask_path(&self) -> Option<PathBuf> {
        match &self.truth {
            PixelTruth::Mask(path) => Some(path.clone()),
            PixelTruth::Normal | PixelTruth::Missing(_) => None,
        }
    }
}

/// Test images ready for `evaluate`, plus the ones that never reach it.
#[derive(Default)]
struct TestSet {
    samples: Vec<Tensor3>,
    labels: Vec<bool>,
    truth: Vec<Array2<bool>>,
    ids: Vec<String>,
    /// (id, label, reason)
    unreadable: Vec<(String, bool, String)>,
}

fn image_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn test_entries(category_dir: &Path) -> anyhow::Result<Vec<TestEntry>> {
    let test_dir = category_dir.join("test");
    let mut defects: Vec<PathBuf> = std::fs::read_dir(&test_dir)
        .with_context(|| format!("reading {}", test_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    defects.sort();

    let mut entries = Vec::new();
    for defect_dir in defects {
        let defect = defect_dir
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        let anomalous = defect != "good";
        for path in image_files(&defect_dir)? {
            let truth = if anomalous {
                let stem = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or_default();
                let mask = category_dir.join("ground_truth").join(&defect).join(format!("{stem}_mask.png"));
                if mask.is_file() {
                    PixelTruth::Mask(mask)
                } else {
                    tracing::warn!(image = %path.display(), mask = %mask.display(), "defect image has no mask");
                    PixelTruth::Missing(mask)
                }
            } else {
                PixelTruth::Normal
            };
            entries.push(TestEntry { path, anomalous, truth });
        }
    }
    Ok(entries)
}

fn assemble(
    entries: &[TestEntry],
    images: Vec<LoadedImage>,
    masks: Vec<ddad_vision::Result<Array2<bool>>>,
) -> TestSet {
    let mut set = TestSet::default();
    for ((entry, image), mask) in entries.iter().zip(images).zip(masks) {
        let id = entry.path.display().to_string();
        if let PixelTruth::Missing(mask) = &entry.truth {
            let reason = format!("ground-truth mask {} is missing", mask.display());
            set.unreadable.push((id, entry.anomalous, reason));
            continue;
        }
        match (image.tensor, mask) {
            (Ok(tensor), Ok(mask)) => {
                set.samples.push(tensor);
                set.labels.push(entry.anomalous);
                set.truth.push(mask);
                set.ids.push(id);
            }
            (Err(e), _) | (_, Err(e)) => set.unreadable.push((id, entry.anomalous, e.to_string())),
        }
    }
    set
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Argument Parsing & Setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut config = InspectConfig::from_path(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(dir) = args.data_dir {
        config.data.data_dir = dir;
    }
    if let Some(category) = args.category {
        config.data.category = category;
    }
    if let Some(seed) = args.seed {
        config.model.seed = Some(seed);
    }
    if config.data.category.is_empty() {
        bail!("no category given; set data.category or pass --category");
    }
    let category_dir = config.data.data_dir.join(&config.data.category);
    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(format!("{}_report.json", config.data.category)));

    // --- 2. Loader Pool Initialization ---
    let pool = LoaderPool::new(
        config.workers(),
        DecodeSettings {
            channels: config.data.input_channel,
            size: config.data.image_size,
        },
    );
    let mut pipeline = InspectionPipeline::new(config)?;

    // --- 3. Normal Images ---
    let train_paths = image_files(&category_dir.join("train").join("good"))?;
    let normal: Vec<_> = pool
        .load_images(&train_paths)
        .await
        .into_iter()
        .filter_map(|loaded| loaded.tensor.ok())
        .collect();
    if normal.is_empty() {
        bail!("no readable training images under {}", category_dir.display());
    }
    tracing::info!(found = train_paths.len(), loaded = normal.len(), "training images loaded");

    // --- 4. Fit or Restore ---
    let checkpoint = args.checkpoint;
    let pipeline = tokio::task::spawn_blocking(move || -> anyhow::Result<InspectionPipeline> {
        match checkpoint {
            Some(path) => {
                let state = ModelState::load(&path).with_context(|| format!("restoring {}", path.display()))?;
                pipeline.load_model_state(state)?;
                pipeline.rebuild_memory_bank(&normal)?;
            }
            None => {
                let summary = pipeline.fit(&normal)?;
                tracing::info!(
                    denoiser_losses = ?summary.denoiser_losses,
                    adaptation_batches = summary.adaptation.batches,
                    bank_vectors = summary.bank_vectors,
                    "fit finished"
                );
            }
        }
        Ok(pipeline)
    })
    .await??;

    // --- 5. Test Images & Masks ---
    let entries = test_entries(&category_dir)?;
    let paths: Vec<PathBuf> = entries.iter().map(|e| e.path.clone()).collect();
    let mask_paths: Vec<Option<PathBuf>> = entries.iter().map(TestEntry::mask_path).collect();
    let (images, masks) = tokio::join!(pool.load_images(&paths), pool.load_masks(&mask_paths));
    pool.shutdown().await;

    let TestSet {
        samples,
        labels,
        truth,
        ids,
        unreadable,
    } = assemble(&entries, images, masks);
    tracing::info!(scored = samples.len(), unreadable = unreadable.len(), "test images loaded");

    // --- 6. Evaluation & Report ---
    let mut report = tokio::task::spawn_blocking(move || pipeline.evaluate(&samples, Some(&labels), Some(&truth)))
        .await??;
    for (sample, id) in report.samples.iter_mut().zip(ids) {
        sample.id = Some(id);
    }
    for (id, label, reason) in unreadable {
        report.push_input_failure(id, Some(label), reason);
    }

    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(&output, json).with_context(|| format!("writing {}", output.display()))?;
    println!(
        "{} samples, {} failed, image threshold {:?}, report at {}",
        report.samples.len(),
        report.failures.total(),
        report.image_threshold,
        output.display()
    );
    Ok(())
}
