// THEORY:
// `InspectConfig` is the single, validated description of a run. It is read once
// from a JSON document with three sections (`data`, `model`, `metrics`), checked in
// one `validate()` pass, and then only read. No component re-parses options or
// falls back to a hidden default at the point of use.
//
// Key architectural principles:
// 1.  **Legacy spellings on the wire, clear names in code**: keys such as
//     `test_trajectoy_steps`, `imput_channel`, `DA_epochs` or `KNN_metric` keep their
//     historical spelling through `#[serde(rename)]`; the Rust fields are spelled
//     normally.
// 2.  **Documented defaults**: every optional key has a default, listed on the field.
//     The one exception is `model.seed`: a run must say how it is seeded, so a
//     missing seed is a config error, and `-1` is the explicit "unseeded" value.
// 3.  **Fail before computing**: anything contradictory (an out-of-range weight, a
//     trajectory longer than its schedule, a layer index past the backbone) is a
//     `Config` error from `validate()`, before any image is touched.

use crate::core_modules::anomaly_map::ScoreAggregate;
use crate::core_modules::memory_bank::{DistanceMetric, KnnAggregate};
use crate::core_modules::noise::{NoiseKind, SeedPolicy};
use crate::core_modules::noise_scheduler::{ScheduleConfig, ScheduleKind};
use crate::core_modules::threshold::{ThresholdCriterion, ThresholdMethod, ThresholdSetting};
use crate::core_modules::trajectory::TrajectoryParams;
use crate::error::{InspectError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectConfig {
    pub data: DataConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Dataset family, informational ("MVTec").
    pub name: String,
    pub data_dir: PathBuf,
    pub category: String,
    /// Side length images are resized to (64).
    pub image_size: u32,
    /// Fit batch size (8).
    pub batch_size: usize,
    /// Adaptation batch size (4).
    #[serde(rename = "DA_batch_size")]
    pub da_batch_size: usize,
    /// Scoring batch size (8).
    pub test_batch_size: usize,
    /// 1 (gray) or 3 (RGB).
    #[serde(rename = "imput_channel")]
    pub input_channel: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            name: "MVTec".into(),
            data_dir: PathBuf::from("datasets/MVTec"),
            category: String::new(),
            image_size: 64,
            batch_size: 8,
            da_batch_size: 4,
            test_batch_size: 8,
            input_channel: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    // --- Seeding ---
    /// Required. `-1` requests an unseeded run.
    pub seed: Option<i64>,
    #[serde(rename = "manualseed")]
    pub manual_seed: bool,

    // --- Trajectory space ---
    pub latent: bool,
    /// Only "haar" is available.
    pub latent_backbone: String,
    pub latent_lossless: bool,

    // --- Schedule and reverse process ---
    pub trajectory_steps: usize,
    #[serde(rename = "test_trajectoy_steps")]
    pub test_trajectory_steps: usize,
    pub skip: usize,
    #[serde(rename = "test_trajectoy_steps_DA")]
    pub test_trajectory_steps_da: usize,
    #[serde(rename = "skip_DA")]
    pub skip_da: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub schedule: ScheduleKind,
    pub noise: NoiseKind,
    pub eta: f64,
    pub eta2: f64,
    pub dynamic_steps: bool,

    // --- Denoiser fitting ---
    pub ema: bool,
    pub ema_rate: f32,
    pub epochs: usize,
    pub learning_rate: f32,

    // --- Domain adaptation ---
    #[serde(rename = "DA_epochs")]
    pub da_epochs: usize,
    #[serde(rename = "DA_fine_tune")]
    pub da_fine_tune: bool,
    #[serde(rename = "DA_rnd_step")]
    pub da_rnd_step: bool,
    #[serde(rename = "DA_learning_rate")]
    pub da_learning_rate: f32,
    #[serde(rename = "DLlambda")]
    pub dl_lambda: f32,

    // --- Backbone and scoring ---
    pub feature_channels: Vec<usize>,
    pub selected_features: Vec<usize>,
    pub knn_k: usize,
    #[serde(rename = "KNN_metric")]
    pub knn_metric: DistanceMetric,
    pub knn_aggregate: KnnAggregate,
    pub distance_metric_eval: DistanceMetric,
    pub anomap_weighting: f32,
    pub anomap_excluded_layers: Vec<usize>,
    pub anomap_sigma: f32,
    /// Blend σ/2, σ and 2σ smoothing of the reconstruction map.
    pub anomap_detail_enhance: bool,
    /// Softmax fusion weights per sample instead of `anomap_weighting`.
    pub anomap_adaptive_fusion: bool,
    pub score_aggregate: ScoreAggregate,
    pub score_top_k: usize,

    // --- Execution ---
    /// Loader pool size; `None` uses the number of CPUs.
    pub num_workers: Option<usize>,
    /// Accepted and ignored.
    pub multi_gpu: bool,
    pub save_model: bool,
    pub checkpoint_dir: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            seed: None,
            manual_seed: true,
            latent: false,
            latent_backbone: "haar".into(),
            latent_lossless: true,
            trajectory_steps: 1000,
            test_trajectory_steps: 250,
            skip: 25,
            test_trajectory_steps_da: 250,
            skip_da: 25,
            beta_start: 0.0001,
            beta_end: 0.02,
            schedule: ScheduleKind::Linear,
            noise: NoiseKind::Gaussian,
            eta: 1.0,
            eta2: 4.0,
            dynamic_steps: false,
            ema: true,
            ema_rate: 0.999,
            epochs: 3,
            learning_rate: 0.5,
            da_epochs: 0,
            da_fine_tune: false,
            da_rnd_step: false,
            da_learning_rate: 0.01,
            dl_lambda: 0.1,
            feature_channels: vec![8, 16, 32],
            selected_features: vec![1, 2],
            knn_k: 3,
            knn_metric: DistanceMetric::L2,
            knn_aggregate: KnnAggregate::Mean,
            distance_metric_eval: DistanceMetric::Combined,
            anomap_weighting: 0.5,
            anomap_excluded_layers: vec![0],
            anomap_sigma: 4.0,
            anomap_detail_enhance: false,
            anomap_adaptive_fusion: false,
            score_aggregate: ScoreAggregate::Max,
            score_top_k: 10,
            num_workers: None,
            multi_gpu: false,
            save_model: false,
            checkpoint_dir: PathBuf::from("checkpoints"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    #[serde(rename = "image_level_AUROC")]
    pub image_level_auroc: bool,
    #[serde(rename = "pixel_level_AUROC")]
    pub pixel_level_auroc: bool,
    #[serde(rename = "image_level_F1Score")]
    pub image_level_f1_score: bool,
    pub pro: bool,
    pub threshold: ThresholdConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub method: ThresholdMethod,
    /// Overrides `method` for image scores.
    pub image_method: Option<ThresholdMethod>,
    /// Overrides `method` for pixel values.
    pub pixel_method: Option<ThresholdMethod>,
    pub manual_image: Option<f32>,
    pub manual_pixel: Option<f32>,
    pub criterion: ThresholdCriterion,
}

impl ThresholdConfig {
    fn resolve(&self, method: Option<ThresholdMethod>, manual: Option<f32>) -> ThresholdSetting {
        match method.unwrap_or(self.method) {
            ThresholdMethod::Manual => ThresholdSetting::Manual(manual),
            ThresholdMethod::Adaptive => ThresholdSetting::Adaptive(self.criterion),
        }
    }

    pub fn image_setting(&self) -> ThresholdSetting {
        self.resolve(self.image_method, self.manual_image)
    }

    pub fn pixel_setting(&self) -> ThresholdSetting {
        self.resolve(self.pixel_method, self.manual_pixel)
    }
}

fn check(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition { Ok(()) } else { Err(InspectError::config(message())) }
}

impl InspectConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| InspectError::io(path, e))?;
        let config = Self::from_json_str(&text)?;
        tracing::info!(path = %path.display(), category = %config.data.category, "configuration loaded");
        Ok(config)
    }

    /// A valid configuration with every default and the given seed.
    pub fn with_seed(seed: i64) -> Self {
        Self {
            data: DataConfig::default(),
            model: ModelConfig {
                seed: Some(seed),
                ..ModelConfig::default()
            },
            metrics: MetricsConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (d, m) = (&self.data, &self.model);

        self.seed_policy()?;
        self.schedule_config().validate()?;

        check((0.0..=1.0).contains(&m.eta), || format!("eta must be in [0, 1], got {}", m.eta))?;
        check(m.eta2 >= 0.0 && m.eta2.is_finite(), || format!("eta2 must be >= 0, got {}", m.eta2))?;
        check(m.skip > 0, || "skip must be positive".into())?;
        check(m.skip_da > 0, || "skip_DA must be positive".into())?;
        check(m.test_trajectory_steps <= m.trajectory_steps, || {
            format!(
                "test_trajectoy_steps ({}) exceeds trajectory_steps ({})",
                m.test_trajectory_steps, m.trajectory_steps
            )
        })?;
        check(m.test_trajectory_steps_da <= m.trajectory_steps, || {
            format!(
                "test_trajectoy_steps_DA ({}) exceeds trajectory_steps ({})",
                m.test_trajectory_steps_da, m.trajectory_steps
            )
        })?;
        check(m.ema_rate > 0.0 && m.ema_rate < 1.0, || {
            format!("ema_rate must be in (0, 1), got {}", m.ema_rate)
        })?;
        check(m.learning_rate.is_finite() && m.learning_rate > 0.0, || {
            format!("learning_rate must be positive, got {}", m.learning_rate)
        })?;
        check(m.da_learning_rate.is_finite() && m.da_learning_rate >= 0.0, || {
            format!("DA_learning_rate must be >= 0, got {}", m.da_learning_rate)
        })?;
        check(m.dl_lambda.is_finite() && m.dl_lambda >= 0.0, || {
            format!("DLlambda must be >= 0, got {}", m.dl_lambda)
        })?;
        check(m.knn_k > 0, || "knn_k must be at least 1".into())?;
        check((0.0..=1.0).contains(&m.anomap_weighting), || {
            format!("anomap_weighting must be in [0, 1], got {}", m.anomap_weighting)
        })?;
        check(m.anomap_sigma.is_finite() && m.anomap_sigma >= 0.0, || {
            format!("anomap_sigma must be >= 0, got {}", m.anomap_sigma)
        })?;
        check(m.score_top_k > 0, || "score_top_k must be at least 1".into())?;
        check(m.latent_backbone == "haar", || {
            format!("latent_backbone {:?} is not available, use \"haar\"", m.latent_backbone)
        })?;
        check(m.num_workers != Some(0), || "num_workers must be positive".into())?;

        check(d.input_channel == 1 || d.input_channel == 3, || {
            format!("imput_channel must be 1 or 3, got {}", d.input_channel)
        })?;
        check(d.batch_size > 0 && d.da_batch_size > 0 && d.test_batch_size > 0, || {
            "batch sizes must be positive".into()
        })?;

        let layers = m.feature_channels.len();
        check(layers > 0, || "feature_channels must not be empty".into())?;
        check(m.feature_channels.iter().all(|&c| c > 0), || {
            "feature_channels entries must be positive".into()
        })?;
        let granularity = 1u32 << (layers - 1).min(16);
        check(d.image_size > 0 && d.image_size % granularity == 0, || {
            format!(
                "image_size {} must be a positive multiple of {granularity} for {layers} backbone layers",
                d.image_size
            )
        })?;
        check(!m.latent || d.image_size % 2 == 0, || {
            format!("image_size {} must be even in latent mode", d.image_size)
        })?;
        for (key, list) in [
            ("selected_features", &m.selected_features),
            ("anomap_excluded_layers", &m.anomap_excluded_layers),
        ] {
            if let Some(bad) = list.iter().find(|&&l| l >= layers) {
                return Err(InspectError::config(format!(
                    "{key} refers to layer {bad}, backbone has {layers}"
                )));
            }
        }
        check(!self.retained_layers().is_empty(), || {
            "no backbone layer is left after anomap_excluded_layers".into()
        })?;

        let t = &self.metrics.threshold;
        for (setting, name) in [(t.image_setting(), "manual_image"), (t.pixel_setting(), "manual_pixel")] {
            if let ThresholdSetting::Manual(Some(v)) = setting {
                check(v.is_finite(), || format!("threshold.{name} must be finite"))?;
            }
        }
        Ok(())
    }

    /// Logs options that are accepted but have no effect.
    pub fn warn_ignored(&self) {
        if self.model.multi_gpu {
            tracing::warn!("multi_gpu is ignored; scoring is data-parallel on the CPU");
        }
    }

    pub fn seed_policy(&self) -> Result<SeedPolicy> {
        let seed = self
            .model
            .seed
            .ok_or_else(|| InspectError::config("model.seed is required (use -1 for an unseeded run)"))?;
        SeedPolicy::from_config(seed, self.model.manual_seed)
            .ok_or_else(|| InspectError::config(format!("seed must be >= 0 or -1, got {seed}")))
    }

    pub fn schedule_config(&self) -> ScheduleConfig {
        ScheduleConfig {
            trajectory_steps: self.model.trajectory_steps,
            beta_start: self.model.beta_start,
            beta_end: self.model.beta_end,
            kind: self.model.schedule,
        }
    }

    pub fn test_trajectory(&self) -> TrajectoryParams {
        TrajectoryParams {
            start: self.model.test_trajectory_steps,
            skip: self.model.skip,
            eta: self.model.eta,
            eta2: self.model.eta2,
            dynamic_steps: self.model.dynamic_steps,
        }
    }

    pub fn adaptation_trajectory(&self) -> TrajectoryParams {
        TrajectoryParams {
            start: self.model.test_trajectory_steps_da,
            skip: self.model.skip_da,
            ..self.test_trajectory()
        }
    }

    /// `selected_features` minus `anomap_excluded_layers`, in selection order.
    pub fn retained_layers(&self) -> Vec<usize> {
        let mut layers: Vec<usize> = Vec::new();
        for &l in &self.model.selected_features {
            if !self.model.anomap_excluded_layers.contains(&l) && !layers.contains(&l) {
                layers.push(l);
            }
        }
        layers
    }

    pub fn workers(&self) -> usize {
        self.model.num_workers.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn image_size(&self) -> usize {
        self.data.image_size as usize
    }
}
