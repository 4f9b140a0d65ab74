// THEORY:
// The `pipeline` module is the top-level API of the engine. `InspectionPipeline`
// encapsulates the full stack behind four calls: `new` (validate and build the fixed
// parts), `fit` (learn normality), `score_batch` (raw per-sample maps) and `evaluate`
// (calibrated maps, scores, thresholds and a serializable report).
//
// Key architectural principles:
// 1.  **Owned state**: the pipeline owns the `ModelState` and the `MemoryBank`. The
//     bank sits behind an `Arc` and is only replaced by `fit` or
//     `rebuild_memory_bank`; scoring only reads.
// 2.  **Data-parallel scoring**: samples of a batch are scored in parallel with rayon.
//     Each sample draws its noise from its own `(seed, purpose, index)` stream, so
//     results are bit-identical whatever the thread interleaving.
// 3.  **Per-sample failure**: a numerical or data failure marks that sample `Failed`,
//     is logged and tallied, and is left out of normalization and thresholds. Its
//     siblings are unaffected. Only configuration problems fail a whole call.
// 4.  **Swappable predictor**: the template denoiser is the default noise predictor;
//     any other `NoisePredictor` can be installed with `with_predictor`.

use crate::config::{InspectConfig, MetricsConfig};
use crate::core_modules::anomaly_map::{FusionCalibration, MapFusion, MapInputs, RawMapBuilder, RawMaps};
use crate::core_modules::denoiser::{FitSettings, NoisePredictor, TemplateDenoiser};
use crate::core_modules::domain_adapter::{AdaptationReport, AdaptationSettings, DomainAdapter};
use crate::core_modules::feature_backbone::{FeatureBackbone, FeatureStack};
use crate::core_modules::latent_codec::{HaarCodec, IdentityCodec, LatentCodec};
use crate::core_modules::memory_bank::{KnnScorer, MemoryBank};
use crate::core_modules::model_state::ModelState;
use crate::core_modules::noise::{NoiseFactory, StreamPurpose};
use crate::core_modules::noise_scheduler::NoiseScheduler;
use crate::core_modules::tensor::tensor::{Map, Tensor3, all_finite, check_shape};
use crate::core_modules::threshold::ThresholdSelector;
use crate::core_modules::trajectory::ReverseTrajectory;
use crate::error::{InspectError, Result};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

// Re-export key data structures for the public API.
pub use crate::core_modules::anomaly_map::FusedMap;
pub use crate::core_modules::denoiser::DiffusionStep;
pub use crate::core_modules::threshold::ThresholdSetting;

/// Why a sample produced no maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SampleFailure {
    /// A non-finite value appeared at noise level `step`.
    Numerical { step: usize, reason: String },
    /// The input was missing or malformed.
    Data { reason: String },
}

impl SampleFailure {
    /// Converts a per-sample error; anything else is handed back unchanged.
    pub fn from_error(error: InspectError) -> std::result::Result<Self, InspectError> {
        match error {
            InspectError::NumericalFailure { step, reason } => Ok(Self::Numerical { step, reason }),
            InspectError::Data(reason) => Ok(Self::Data { reason }),
            InspectError::Image(e) => Ok(Self::Data { reason: e.to_string() }),
            other => Err(other),
        }
    }
}

/// Result of scoring one sample.
#[derive(Debug, Clone)]
pub enum SampleOutcome {
    Scored(RawMaps),
    Failed(SampleFailure),
}

/// Count of suppressed per-sample failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureTally {
    pub numerical: usize,
    pub data: usize,
}

impl FailureTally {
    pub fn record(&mut self, failure: &SampleFailure) {
        match failure {
            SampleFailure::Numerical { .. } => self.numerical += 1,
            SampleFailure::Data { .. } => self.data += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.numerical + self.data
    }
}

/// Per-sample entry of an `EvaluationReport`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleReport {
    pub index: usize,
    /// Caller-supplied identifier (usually the file path).
    pub id: Option<String>,
    pub label: Option<bool>,
    /// Image-level anomaly score in [0, 1].
    pub score: Option<f32>,
    /// Fused anomaly map in [0, 1] at `image_size`.
    pub map: Option<Map>,
    /// `score >= image_threshold`.
    pub decision: Option<bool>,
    /// `map >= pixel_threshold`.
    pub pixel_decisions: Option<Array2<bool>>,
    pub failure: Option<SampleFailure>,
}

/// Everything an external metrics consumer needs from one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub model_version: u64,
    pub samples: Vec<SampleReport>,
    pub image_threshold: Option<f32>,
    pub pixel_threshold: Option<f32>,
    pub failures: FailureTally,
    pub calibration: Option<FusionCalibration>,
    /// Metric flags from the configuration, passed through.
    pub metrics: MetricsConfig,
}

impl EvaluationReport {
    /// Appends a sample that never reached the engine (e.g. an undecodable file).
    pub fn push_input_failure(&mut self, id: impl Into<String>, label: Option<bool>, reason: impl Into<String>) {
        let failure = SampleFailure::Data { reason: reason.into() };
        self.failures.record(&failure);
        self.samples.push(SampleReport {
            index: self.samples.len(),
            id: Some(id.into()),
            label,
            score: None,
            map: None,
            decision: None,
            pixel_decisions: None,
            failure: Some(failure),
        });
    }
}

/// Summary of a `fit` call.
#[derive(Debug, Clone, Default)]
pub struct FitSummary {
    pub denoiser_losses: Vec<f64>,
    pub adaptation: AdaptationReport,
    pub bank_vectors: usize,
    pub checkpoint: Option<PathBuf>,
}

/// Everything one scoring call reads, assembled once per call.
struct ScoringContext {
    backbone: FeatureBackbone,
    predictor: Arc<dyn NoisePredictor>,
    knn: KnnScorer,
    maps: RawMapBuilder,
}

/// The main, top-level struct for the inspection engine.
pub struct InspectionPipeline {
    config: InspectConfig,
    scheduler: NoiseScheduler,
    codec: Box<dyn LatentCodec>,
    noise: NoiseFactory,
    state: Option<ModelState>,
    bank: Option<Arc<MemoryBank>>,
    predictor: Option<Arc<dyn NoisePredictor>>,
}

impl InspectionPipeline {
    pub fn new(config: InspectConfig) -> Result<Self> {
        config.validate()?;
        config.warn_ignored();
        let scheduler = NoiseScheduler::new(&config.schedule_config())?;
        let codec: Box<dyn LatentCodec> = if config.model.latent {
            Box::new(HaarCodec::new(config.model.latent_lossless))
        } else {
            Box::new(IdentityCodec)
        };
        let noise = NoiseFactory::new(config.seed_policy()?, config.model.noise);
        tracing::info!(
            category = %config.data.category,
            image_size = config.data.image_size,
            latent = config.model.latent,
            base_seed = noise.base_seed(),
            "inspection pipeline created"
        );
        Ok(Self {
            config,
            scheduler,
            codec,
            noise,
            state: None,
            bank: None,
            predictor: None,
        })
    }

    /// Replaces the template denoiser with another noise predictor, for fitting and scoring.
    pub fn with_predictor(mut self, predictor: Arc<dyn NoisePredictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn config(&self) -> &InspectConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &NoiseScheduler {
        &self.scheduler
    }

    pub fn model_state(&self) -> Option<&ModelState> {
        self.state.as_ref()
    }

    pub fn memory_bank(&self) -> Option<&Arc<MemoryBank>> {
        self.bank.as_ref()
    }

    fn latent_shape(&self) -> (usize, usize, usize) {
        let side = self.config.image_size() / self.codec.downscale();
        (self.config.data.input_channel, side, side)
    }

    fn check_input(&self, image: &Tensor3) -> Result<()> {
        check_shape(image, self.config.data.input_channel, self.config.image_size())?;
        if !all_finite(image) {
            return Err(InspectError::data("input contains non-finite values"));
        }
        Ok(())
    }

    /// Installs a previously exported state. The memory bank must be rebuilt afterwards.
    pub fn load_model_state(&mut self, state: ModelState) -> Result<()> {
        let expected_layers = self.config.model.feature_channels.len();
        if state.backbone.input_channels != self.config.data.input_channel
            || state.backbone.layers.len() != expected_layers
        {
            return Err(InspectError::config(format!(
                "model state backbone ({} channels, {} layers) does not match the configuration ({} channels, {} layers)",
                state.backbone.input_channels,
                state.backbone.layers.len(),
                self.config.data.input_channel,
                expected_layers
            )));
        }
        if state.denoiser.template.dim() != self.latent_shape() {
            return Err(InspectError::config(format!(
                "model state template {:?} does not match the trajectory space {:?}",
                state.denoiser.template.dim(),
                self.latent_shape()
            )));
        }
        tracing::info!(version = state.version, "model state loaded");
        self.state = Some(state);
        self.bank = None;
        Ok(())
    }

    /// Encodes and decodes, giving the image the engine actually compares against.
    fn reference(&self, image: &Tensor3) -> Result<Tensor3> {
        self.codec.decode(&self.codec.encode(image)?)
    }

    fn predictor_for(&self, state: &ModelState) -> Arc<dyn NoisePredictor> {
        match &self.predictor {
            Some(predictor) => Arc::clone(predictor),
            None => Arc::new(TemplateDenoiser::from_weights(state.effective_denoiser())),
        }
    }

    /// Learns normality from `normal` images: denoiser template, domain adaptation,
    /// then the memory bank.
    #[tracing::instrument(skip_all, fields(images = normal.len()))]
    pub fn fit(&mut self, normal: &[Tensor3]) -> Result<FitSummary> {
        if normal.is_empty() {
            return Err(InspectError::data("fit needs at least one normal image"));
        }
        for image in normal {
            self.check_input(image)?;
        }
        let model = &self.config.model;

        let mut seed_stream = self.noise.stream(StreamPurpose::Backbone, 0);
        let mut backbone =
            FeatureBackbone::new(self.config.data.input_channel, &model.feature_channels, &mut seed_stream)?;
        backbone.calibrate(normal)?;

        let latents: Vec<Tensor3> = normal
            .par_chunks(self.config.data.batch_size)
            .map(|batch| {
                batch
                    .iter()
                    .map(|image| self.codec.encode(image).map(|code| code.latent))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        let mut denoiser = TemplateDenoiser::new(self.latent_shape());
        let mut state = ModelState::new(backbone.weights().clone(), denoiser.weights().clone());
        state.version = self.state.as_ref().map_or(0, |s| s.version);
        if model.ema {
            state.enable_ema(model.ema_rate);
        }
        let fit = denoiser.fit(
            &latents,
            &self.scheduler,
            FitSettings {
                epochs: model.epochs,
                learning_rate: model.learning_rate,
            },
            &self.noise,
            |weights| {
                state.denoiser.template.assign(&weights.template);
                state.update_template_ema();
            },
        )?;

        let predictor = self.predictor_for(&state);
        let adapter = DomainAdapter::new(
            &self.scheduler,
            self.codec.as_ref(),
            predictor.as_ref(),
            AdaptationSettings {
                enabled: model.da_fine_tune,
                epochs: model.da_epochs,
                batch_size: self.config.data.da_batch_size,
                learning_rate: model.da_learning_rate,
                distill_weight: model.dl_lambda,
                trajectory: self.config.adaptation_trajectory(),
                random_level: model.da_rnd_step,
            },
        );
        let adaptation = adapter.adapt(&mut state, normal, &self.noise)?;

        state.bump_version();
        self.state = Some(state);
        let bank_vectors = self.rebuild_memory_bank(normal)?;

        let checkpoint = if self.config.model.save_model {
            Some(self.save_checkpoint()?)
        } else {
            None
        };
        tracing::info!(
            version = self.state.as_ref().map_or(0, |s| s.version),
            bank_vectors,
            "pipeline fitted"
        );
        Ok(FitSummary {
            denoiser_losses: fit.epoch_losses,
            adaptation,
            bank_vectors,
            checkpoint,
        })
    }

    /// Rebuilds the memory bank from normal images with the current model state.
    pub fn rebuild_memory_bank(&mut self, normal: &[Tensor3]) -> Result<usize> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| InspectError::config("memory bank needs a fitted or loaded model state"))?;
        let backbone = FeatureBackbone::from_weights(state.effective_backbone());
        let stacks: Vec<FeatureStack> = normal
            .par_chunks(self.config.data.batch_size)
            .map(|batch| {
                batch
                    .iter()
                    .map(|image| {
                        self.check_input(image)?;
                        backbone.forward(&self.reference(image)?)
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();
        let bank = MemoryBank::build(&stacks, &self.config.retained_layers())?;
        let vectors = bank.len();
        self.bank = Some(Arc::new(bank));
        Ok(vectors)
    }

    /// Writes the model state to `checkpoint_dir/<category>/model_state.json`.
    pub fn save_checkpoint(&self) -> Result<PathBuf> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| InspectError::config("no model state to save"))?;
        let path = self
            .config
            .model
            .checkpoint_dir
            .join(&self.config.data.category)
            .join("model_state.json");
        state.save(&path)?;
        Ok(path)
    }

    fn scoring_context(&self) -> Result<ScoringContext> {
        let (state, bank) = match (&self.state, &self.bank) {
            (Some(state), Some(bank)) => (state, bank),
            _ => return Err(InspectError::config("pipeline must be fitted before scoring")),
        };
        let model = &self.config.model;
        Ok(ScoringContext {
            backbone: FeatureBackbone::from_weights(state.effective_backbone()),
            predictor: self.predictor_for(state),
            knn: KnnScorer::new(Arc::clone(bank), model.knn_k, model.knn_metric, model.knn_aggregate)?,
            maps: RawMapBuilder {
                image_size: self.config.image_size(),
                layers: self.config.retained_layers(),
                eval_metric: model.distance_metric_eval,
                sigma: model.anomap_sigma,
                detail_enhance: model.anomap_detail_enhance,
            },
        })
    }

    fn score_sample(&self, context: &ScoringContext, index: usize, image: &Tensor3) -> Result<RawMaps> {
        self.check_input(image)?;
        let code = self.codec.encode(image)?;
        let mut stream = self.noise.stream(StreamPurpose::Evaluation, index as u64);
        let walk = ReverseTrajectory::from_clean(&self.scheduler, self.config.test_trajectory(), &code.latent, &mut stream)?;
        let denoised = walk.run(context.predictor.as_ref(), &mut stream).into_result()?;

        let reconstruction = self.codec.decode_latent(&denoised);
        let reference = self.codec.decode(&code)?;
        let input_features = context.backbone.forward(&reference)?;
        let reconstruction_features = context.backbone.forward(&reconstruction)?;
        let knn_maps = context.knn.score_map(&input_features)?;
        context.maps.build(MapInputs {
            input: &reference,
            reconstruction: &reconstruction,
            latents: self.config.model.latent.then_some((&code.latent, &denoised)),
            input_features: &input_features,
            reconstruction_features: &reconstruction_features,
            knn_maps: &knn_maps,
        })
    }

    /// Raw, un-normalized maps for each sample of a batch.
    pub fn score_batch(&self, batch: &[Tensor3]) -> Result<Vec<SampleOutcome>> {
        self.score_from(0, batch)
    }

    /// Like `score_batch`, with noise streams starting at sample index `first_index`.
    pub fn score_from(&self, first_index: usize, batch: &[Tensor3]) -> Result<Vec<SampleOutcome>> {
        let context = self.scoring_context()?;
        batch
            .par_iter()
            .enumerate()
            .map(|(offset, image)| {
                let index = first_index + offset;
                match self.score_sample(&context, index, image) {
                    Ok(maps) => Ok(SampleOutcome::Scored(maps)),
                    Err(error) => {
                        let failure = SampleFailure::from_error(error)?;
                        tracing::warn!(sample = index, failure = ?failure, "sample failed and was excluded");
                        Ok(SampleOutcome::Failed(failure))
                    }
                }
            })
            .collect()
    }

    /// Scores, calibrates and thresholds a whole evaluation set.
    ///
    /// `labels[i]` marks anomalous samples; `masks[i]` marks anomalous pixels. Either
    /// may be omitted, in which case adaptive thresholds for that granularity are not set.
    #[tracing::instrument(skip_all, fields(samples = samples.len()))]
    pub fn evaluate(
        &self,
        samples: &[Tensor3],
        labels: Option<&[bool]>,
        masks: Option<&[Array2<bool>]>,
    ) -> Result<EvaluationReport> {
        if labels.is_some_and(|l| l.len() != samples.len()) {
            return Err(InspectError::data("labels and samples differ in length"));
        }
        let size = self.config.image_size();
        if let Some(masks) = masks {
            if masks.len() != samples.len() {
                return Err(InspectError::data("masks and samples differ in length"));
            }
            if masks.iter().any(|m| m.dim() != (size, size)) {
                return Err(InspectError::data(format!("masks must be {size}x{size}")));
            }
        }

        let mut outcomes = Vec::with_capacity(samples.len());
        for (batch_index, batch) in samples.chunks(self.config.data.test_batch_size).enumerate() {
            let first = batch_index * self.config.data.test_batch_size;
            outcomes.extend(self.score_from(first, batch)?);
            tracing::debug!(batch = batch_index, done = outcomes.len(), "evaluation batch scored");
        }

        let model = &self.config.model;
        let fusion = MapFusion {
            weight: model.anomap_weighting,
            aggregate: model.score_aggregate,
            top_k: model.score_top_k,
            adaptive: model.anomap_adaptive_fusion,
        };
        let scored: Vec<(usize, &RawMaps)> = outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| match o {
                SampleOutcome::Scored(maps) => Some((i, maps)),
                SampleOutcome::Failed(_) => None,
            })
            .collect();
        let raws: Vec<&RawMaps> = scored.iter().map(|(_, m)| *m).collect();
        let (calibration, fused) = if raws.is_empty() {
            (None, Vec::new())
        } else {
            let (calibration, fused) = fusion.fuse(&raws);
            (Some(calibration), fused)
        };

        let thresholds = &self.config.metrics.threshold;
        let scores: Vec<f32> = fused.iter().map(|f| f.score).collect();
        let scored_labels: Option<Vec<bool>> = labels.map(|l| scored.iter().map(|(i, _)| l[*i]).collect());
        let image_threshold = ThresholdSelector::select(&scores, scored_labels.as_deref(), thresholds.image_setting());

        let (pixel_values, pixel_labels): (Vec<f32>, Option<Vec<bool>>) = match masks {
            Some(masks) => {
                let values = fused.iter().flat_map(|f| f.map.iter().copied()).collect();
                let truth = scored.iter().flat_map(|(i, _)| masks[*i].iter().copied()).collect();
                (values, Some(truth))
            }
            None => (fused.iter().flat_map(|f| f.map.iter().copied()).collect(), None),
        };
        let pixel_threshold =
            ThresholdSelector::select(&pixel_values, pixel_labels.as_deref(), thresholds.pixel_setting());

        let mut failures = FailureTally::default();
        let mut fused_iter = fused.into_iter();
        let mut reports = Vec::with_capacity(samples.len());
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let label = labels.map(|l| l[index]);
            let mut report = SampleReport {
                index,
                id: None,
                label,
                score: None,
                map: None,
                decision: None,
                pixel_decisions: None,
                failure: None,
            };
            match outcome {
                SampleOutcome::Scored(_) => {
                    if let Some(f) = fused_iter.next() {
                        report.decision = image_threshold.map(|t| f.score >= t);
                        report.pixel_decisions = pixel_threshold.map(|t| f.map.mapv(|v| v >= t));
                        report.score = Some(f.score);
                        report.map = Some(f.map);
                    }
                }
                SampleOutcome::Failed(failure) => {
                    failures.record(&failure);
                    report.failure = Some(failure);
                }
            }
            reports.push(report);
        }

        let version = self.state.as_ref().map_or(0, |s| s.version);
        tracing::info!(
            scored = reports.len() - failures.total(),
            numerical_failures = failures.numerical,
            data_failures = failures.data,
            image_threshold = ?image_threshold,
            pixel_threshold = ?pixel_threshold,
            "evaluation finished"
        );
        Ok(EvaluationReport {
            model_version: version,
            samples: reports,
            image_threshold,
            pixel_threshold,
            failures,
            calibration,
            metrics: self.config.metrics.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::noise::{NoiseKind, NoiseSource};

    fn small_config() -> InspectConfig {
        let mut config = InspectConfig::with_seed(5);
        config.data.image_size = 16;
        config.model.feature_channels = vec![4, 8];
        config.model.selected_features = vec![1];
        config.model.trajectory_steps = 100;
        config.model.test_trajectory_steps = 20;
        config.model.test_trajectory_steps_da = 20;
        config.model.skip = 5;
        config.model.epochs = 2;
        config.model.anomap_sigma = 1.0;
        config
    }

    fn images(count: u64, seed: u64) -> Vec<Tensor3> {
        (0..count)
            .map(|i| {
                let mut source = NoiseSource::from_seed(seed + i, NoiseKind::Uniform);
                source.noise_like(&Tensor3::zeros((3, 16, 16))) * 0.1
            })
            .collect()
    }

    #[test]
    fn scoring_before_fit_is_a_config_error() {
        let pipeline = InspectionPipeline::new(small_config()).unwrap();
        assert!(matches!(pipeline.score_batch(&images(1, 0)), Err(InspectError::Config(_))));
    }

    #[test]
    fn wrong_shape_sample_fails_alone() {
        let mut pipeline = InspectionPipeline::new(small_config()).unwrap();
        pipeline.fit(&images(4, 0)).unwrap();
        let mut batch = images(2, 50);
        batch.push(Tensor3::zeros((1, 16, 16)));
        let outcomes = pipeline.score_batch(&batch).unwrap();
        assert!(matches!(outcomes[0], SampleOutcome::Scored(_)));
        assert!(matches!(outcomes[1], SampleOutcome::Scored(_)));
        assert!(matches!(outcomes[2], SampleOutcome::Failed(SampleFailure::Data { .. })));
    }

    #[test]
    fn fit_bumps_version_and_loaded_state_needs_a_bank() {
        let mut pipeline = InspectionPipeline::new(small_config()).unwrap();
        pipeline.fit(&images(3, 0)).unwrap();
        let state = pipeline.model_state().unwrap().clone();
        assert_eq!(state.version, 1);
        pipeline.fit(&images(3, 0)).unwrap();
        assert_eq!(pipeline.model_state().unwrap().version, 2);

        let mut fresh = InspectionPipeline::new(small_config()).unwrap();
        fresh.load_model_state(state).unwrap();
        assert!(fresh.score_batch(&images(1, 9)).is_err());
        fresh.rebuild_memory_bank(&images(3, 0)).unwrap();
        assert_eq!(fresh.score_batch(&images(1, 9)).unwrap().len(), 1);
    }

    #[test]
    fn mismatched_state_is_rejected() {
        let mut pipeline = InspectionPipeline::new(small_config()).unwrap();
        pipeline.fit(&images(2, 0)).unwrap();
        let state = pipeline.model_state().unwrap().clone();
        let mut other = small_config();
        other.model.feature_channels = vec![4, 8, 8];
        let mut mismatched = InspectionPipeline::new(other).unwrap();
        assert!(matches!(mismatched.load_model_state(state), Err(InspectError::Config(_))));
    }
}
