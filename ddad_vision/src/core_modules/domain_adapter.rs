// THEORY:
// The `DomainAdapter` teaches the backbone what the diffusion reconstructions of this
// category look like. A seeded backbone compares images in a generic feature space;
// after adaptation, a clean image and its own reconstruction land close together,
// while a defect and its (defect-free) reconstruction still do not.
//
// Key architectural principles:
// 1.  **Reconstruct, then align**: every training image is noised to the adaptation
//     level, walked back with the reverse trajectory (stride `skip_DA`), and decoded.
//     The loss pulls the reconstruction's features towards the target's features.
// 2.  **Anchor to the past**: a distillation term (`DLlambda`) keeps the adapted
//     features close to the frozen pre-adaptation backbone on the same target, so
//     adaptation cannot collapse the feature space.
// 3.  **Layer-local updates**: only each layer's γ and β move. Gradients are taken
//     layer by layer on the pre-ReLU affine output, which keeps every update a small
//     closed-form step.
// 4.  **Strictly sequential batches**: batch `b + 1` always sees the weights batch `b`
//     produced. Reconstructions inside one batch are independent and run in parallel,
//     but are reduced in sample order, so results are deterministic.
// 5.  **Explicit bypass**: with `DA_fine_tune` off or `DA_epochs == 0` the adapter
//     returns before touching the model, leaving every weight byte-identical.

use crate::core_modules::denoiser::NoisePredictor;
use crate::core_modules::feature_backbone::{FeatureBackbone, LayerTrace, channel_moments};
use crate::core_modules::latent_codec::LatentCodec;
use crate::core_modules::model_state::ModelState;
use crate::core_modules::noise::{NoiseFactory, StreamPurpose};
use crate::core_modules::noise_scheduler::NoiseScheduler;
use crate::core_modules::tensor::tensor::Tensor3;
use crate::core_modules::trajectory::{ReverseTrajectory, TrajectoryOutcome, TrajectoryParams};
use crate::error::{InspectError, Result};
use ndarray::{Array1, Zip};
use rayon::prelude::*;

const STATS_MOMENTUM: f32 = 0.1;

/// Knobs of one adaptation run.
#[derive(Debug, Clone, Copy)]
pub struct AdaptationSettings {
    /// `DA_fine_tune`.
    pub enabled: bool,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Weight of the distillation term (`DLlambda`).
    pub distill_weight: f32,
    /// Trajectory shape; `start` is the (maximum) adaptation level.
    pub trajectory: TrajectoryParams,
    /// Draw the level uniformly from `1..=start` for every batch.
    pub random_level: bool,
}

/// What an adaptation run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdaptationReport {
    pub applied: bool,
    pub batches: usize,
    /// Reconstructions that aborted and were left out of their batch.
    pub aborted: usize,
    pub epoch_losses: Vec<f64>,
}

pub struct DomainAdapter<'a> {
    scheduler: &'a NoiseScheduler,
    codec: &'a dyn LatentCodec,
    predictor: &'a dyn NoisePredictor,
    settings: AdaptationSettings,
}

/// Per-layer gradient and loss accumulators for one batch.
struct LayerGradients {
    gamma: Vec<Array1<f32>>,
    beta: Vec<Array1<f32>>,
    loss: f64,
    samples: usize,
}

impl LayerGradients {
    fn zeros(backbone: &FeatureBackbone) -> Self {
        let widths: Vec<usize> = backbone.weights().layers.iter().map(|l| l.out_channels()).collect();
        Self {
            gamma: widths.iter().map(|&w| Array1::zeros(w)).collect(),
            beta: widths.iter().map(|&w| Array1::zeros(w)).collect(),
            loss: 0.0,
            samples: 0,
        }
    }
}

/// The reconstruction-side and target-side traces of one sample.
struct SampleTraces {
    target: Vec<LayerTrace>,
    reconstruction: Vec<LayerTrace>,
}

impl<'a> DomainAdapter<'a> {
    pub fn new(
        scheduler: &'a NoiseScheduler,
        codec: &'a dyn LatentCodec,
        predictor: &'a dyn NoisePredictor,
        settings: AdaptationSettings,
    ) -> Self {
        Self {
            scheduler,
            codec,
            predictor,
            settings,
        }
    }

    /// Adapts `state.backbone` to reconstructions of `images`.
    #[tracing::instrument(skip_all, fields(images = images.len(), epochs = self.settings.epochs))]
    pub fn adapt(&self, state: &mut ModelState, images: &[Tensor3], noise: &NoiseFactory) -> Result<AdaptationReport> {
        let settings = self.settings;
        if !settings.enabled || settings.epochs == 0 {
            tracing::info!(
                fine_tune = settings.enabled,
                epochs = settings.epochs,
                "domain adaptation bypassed"
            );
            return Ok(AdaptationReport::default());
        }
        if images.is_empty() {
            return Err(InspectError::data("domain adaptation needs at least one training image"));
        }
        if settings.batch_size == 0 {
            return Err(InspectError::config("DA_batch_size must be positive"));
        }

        // Distillation targets come from the backbone as it was before any update.
        let frozen = FeatureBackbone::from_weights(state.backbone.clone());
        let anchors: Vec<Vec<Tensor3>> = images
            .par_iter()
            .map(|image| {
                frozen
                    .forward_detailed(image)
                    .map(|traces| traces.into_iter().map(|t| t.affine).collect())
            })
            .collect::<Result<_>>()?;

        let mut levels = noise.stream(StreamPurpose::AdaptationLevels, 0);
        let mut report = AdaptationReport {
            applied: true,
            ..Default::default()
        };
        for epoch in 0..settings.epochs {
            let (mut epoch_loss, mut epoch_samples) = (0.0f64, 0usize);
            for (batch_index, batch) in images.chunks(settings.batch_size).enumerate() {
                let level = match (settings.random_level, settings.trajectory.start) {
                    (_, 0) => 0,
                    (true, max) => levels.uniform_level(1, max),
                    (false, max) => max,
                };
                let offset = batch_index * settings.batch_size;
                let current = FeatureBackbone::from_weights(state.backbone.clone());
                let traces: Vec<Option<SampleTraces>> = batch
                    .par_iter()
                    .enumerate()
                    .map(|(i, image)| {
                        let index = (epoch * images.len() + offset + i) as u64;
                        self.trace_sample(&current, image, level, noise, index)
                    })
                    .collect::<Result<_>>()?;

                let mut gradients = LayerGradients::zeros(&current);
                let mut batch_moments: Vec<Vec<Tensor3>> = vec![Vec::new(); current.num_layers()];
                for (i, sample) in traces.iter().enumerate() {
                    let Some(sample) = sample else {
                        report.aborted += 1;
                        continue;
                    };
                    self.accumulate(&current, sample, &anchors[offset + i], &mut gradients);
                    for (layer, trace) in sample.target.iter().enumerate() {
                        batch_moments[layer].push(trace.pre_norm.clone());
                    }
                }
                report.batches += 1;
                if gradients.samples == 0 {
                    tracing::warn!(epoch, batch = batch_index, "every reconstruction in the batch aborted");
                    continue;
                }
                self.apply(state, &gradients, &batch_moments);
                state.update_backbone_ema();
                let batch_loss = gradients.loss / gradients.samples as f64;
                tracing::debug!(epoch, batch = batch_index, level, loss = batch_loss, "adaptation batch applied");
                epoch_loss += gradients.loss;
                epoch_samples += gradients.samples;
            }
            let mean = epoch_loss / epoch_samples.max(1) as f64;
            tracing::info!(epoch, loss = mean, "adaptation epoch finished");
            report.epoch_losses.push(mean);
        }
        if report.aborted > 0 {
            tracing::warn!(aborted = report.aborted, "reconstructions aborted during adaptation");
        }
        state.bump_version();
        Ok(report)
    }

    /// Reconstructs one image and traces it and its target through `backbone`.
    /// `None` when the trajectory aborted.
    fn trace_sample(
        &self,
        backbone: &FeatureBackbone,
        image: &Tensor3,
        level: usize,
        noise: &NoiseFactory,
        index: u64,
    ) -> Result<Option<SampleTraces>> {
        let mut stream = noise.stream(StreamPurpose::Adaptation, index);
        let code = self.codec.encode(image)?;
        let params = TrajectoryParams {
            start: level,
            ..self.settings.trajectory
        };
        let walk = ReverseTrajectory::from_clean(self.scheduler, params, &code.latent, &mut stream)?;
        let denoised = match walk.run(self.predictor, &mut stream) {
            TrajectoryOutcome::Completed { denoised, .. } => denoised,
            TrajectoryOutcome::Aborted { step, reason } => {
                tracing::warn!(sample = index, step, %reason, "adaptation reconstruction aborted");
                return Ok(None);
            }
        };
        let reconstruction = self.codec.decode_latent(&denoised);
        Ok(Some(SampleTraces {
            target: backbone.forward_detailed(image)?,
            reconstruction: backbone.forward_detailed(&reconstruction)?,
        }))
    }

    /// Adds one sample's layer-local gradients of
    /// `mean((γ·(n_r - n_x))²) + λ·mean((γ·n_x + β - f0)²)` to `gradients`.
    fn accumulate(
        &self,
        backbone: &FeatureBackbone,
        sample: &SampleTraces,
        anchors: &[Tensor3],
        gradients: &mut LayerGradients,
    ) {
        let lambda = self.settings.distill_weight;
        for (layer_index, layer) in backbone.weights().layers.iter().enumerate() {
            let (target, recon) = (&sample.target[layer_index], &sample.reconstruction[layer_index]);
            let anchor = &anchors[layer_index];
            for c in 0..layer.out_channels() {
                let gamma = layer.gamma[c];
                let n_x = target.normalized.index_axis(ndarray::Axis(0), c);
                let n_r = recon.normalized.index_axis(ndarray::Axis(0), c);
                let a_x = target.affine.index_axis(ndarray::Axis(0), c);
                let f0 = anchor.index_axis(ndarray::Axis(0), c);
                let count = n_x.len().max(1) as f32;

                let (mut d_gamma, mut d_beta, mut loss) = (0.0f32, 0.0f32, 0.0f64);
                Zip::from(&n_x)
                    .and(&n_r)
                    .and(&a_x)
                    .and(&f0)
                    .for_each(|&nx, &nr, &ax, &f| {
                        let gap = nr - nx;
                        let residual = ax - f;
                        d_gamma += gamma * gap * gap + lambda * residual * nx;
                        d_beta += lambda * residual;
                        loss += ((gamma * gap).powi(2) + lambda * residual * residual) as f64;
                    });
                gradients.gamma[layer_index][c] += 2.0 * d_gamma / count;
                gradients.beta[layer_index][c] += 2.0 * d_beta / count;
                gradients.loss += loss / count as f64;
            }
        }
        gradients.samples += 1;
    }

    fn apply(&self, state: &mut ModelState, gradients: &LayerGradients, moments: &[Vec<Tensor3>]) {
        let lr = self.settings.learning_rate / gradients.samples as f32;
        for (index, layer) in state.backbone.layers.iter_mut().enumerate() {
            layer.gamma.scaled_add(-lr, &gradients.gamma[index]);
            layer.beta.scaled_add(-lr, &gradients.beta[index]);
            if moments[index].is_empty() {
                continue;
            }
            let (mean, var) = channel_moments(&moments[index]);
            layer
                .running_mean
                .zip_mut_with(&mean, |r, &m| *r = (1.0 - STATS_MOMENTUM) * *r + STATS_MOMENTUM * m);
            layer
                .running_var
                .zip_mut_with(&var, |r, &v| *r = (1.0 - STATS_MOMENTUM) * *r + STATS_MOMENTUM * v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::denoiser::{TemplateDenoiser, TemplateWeights};
    use crate::core_modules::latent_codec::IdentityCodec;
    use crate::core_modules::noise::{NoiseKind, NoiseSource, SeedPolicy};
    use crate::core_modules::noise_scheduler::{ScheduleConfig, ScheduleKind};

    fn scheduler() -> NoiseScheduler {
        NoiseScheduler::new(&ScheduleConfig {
            trajectory_steps: 200,
            beta_start: 0.0001,
            beta_end: 0.02,
            kind: ScheduleKind::Linear,
        })
        .unwrap()
    }

    fn images() -> Vec<Tensor3> {
        (0..3)
            .map(|i| {
                let mut source = NoiseSource::from_seed(100 + i, NoiseKind::Uniform);
                source.noise_like(&Tensor3::zeros((3, 8, 8))) * 0.3
            })
            .collect()
    }

    fn model() -> (ModelState, TemplateDenoiser) {
        let mut noise = NoiseSource::from_seed(7, NoiseKind::Gaussian);
        let mut backbone = FeatureBackbone::new(3, &[4, 4], &mut noise).unwrap();
        backbone.calibrate(&images()).unwrap();
        let denoiser = TemplateDenoiser::from_weights(TemplateWeights {
            template: Tensor3::zeros((3, 8, 8)),
        });
        (
            ModelState::new(backbone.weights().clone(), denoiser.weights().clone()),
            denoiser,
        )
    }

    fn settings(enabled: bool, epochs: usize) -> AdaptationSettings {
        AdaptationSettings {
            enabled,
            epochs,
            batch_size: 2,
            learning_rate: 0.01,
            distill_weight: 0.1,
            trajectory: TrajectoryParams {
                start: 40,
                skip: 10,
                eta: 0.0,
                eta2: 4.0,
                dynamic_steps: false,
            },
            random_level: true,
        }
    }

    #[test]
    fn zero_epochs_leave_weights_untouched() {
        let scheduler = scheduler();
        let (mut state, denoiser) = model();
        let before = serde_json::to_vec(&state).unwrap();
        let factory = NoiseFactory::new(SeedPolicy::Fixed(1), NoiseKind::Gaussian);
        for (enabled, epochs) in [(true, 0), (false, 3)] {
            let adapter = DomainAdapter::new(&scheduler, &IdentityCodec, &denoiser, settings(enabled, epochs));
            let report = adapter.adapt(&mut state, &images(), &factory).unwrap();
            assert!(!report.applied);
        }
        assert_eq!(serde_json::to_vec(&state).unwrap(), before);
    }

    #[test]
    fn adaptation_moves_affine_parameters_only() {
        let scheduler = scheduler();
        let (mut state, denoiser) = model();
        let before = state.snapshot();
        let factory = NoiseFactory::new(SeedPolicy::Fixed(1), NoiseKind::Gaussian);
        let adapter = DomainAdapter::new(&scheduler, &IdentityCodec, &denoiser, settings(true, 2));
        let report = adapter.adapt(&mut state, &images(), &factory).unwrap();
        assert!(report.applied);
        assert_eq!(report.batches, 4);
        assert_eq!(report.aborted, 0);
        assert_eq!(state.version, before.version + 1);
        for (after, prior) in state.backbone.layers.iter().zip(before.backbone.layers.iter()) {
            assert_eq!(after.kernel, prior.kernel);
        }
        assert_ne!(state.backbone, before.backbone);
    }

    #[test]
    fn adaptation_is_deterministic_for_a_seed() {
        let scheduler = scheduler();
        let factory = NoiseFactory::new(SeedPolicy::Fixed(9), NoiseKind::Gaussian);
        let run = || {
            let (mut state, denoiser) = model();
            let adapter = DomainAdapter::new(&scheduler, &IdentityCodec, &denoiser, settings(true, 1));
            adapter.adapt(&mut state, &images(), &factory).unwrap();
            state
        };
        assert_eq!(run(), run());
    }
}
