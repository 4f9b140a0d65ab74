// THEORY:
// The denoising network answers one question for the reverse trajectory: "given a
// noised sample at level t, what noise was added?". The engine only depends on the
// `NoisePredictor` trait, so any network that can answer it plugs in.
//
// Key architectural principles:
// 1.  **Trait seam**: `NoisePredictor::predict_noise` takes the noised state and the
//     `DiffusionStep` (level and retention) and returns ε̂ with the same shape. It is
//     `&self`, `Send + Sync`, and may be shared by every scoring thread.
// 2.  **Template denoiser**: the shipped predictor keeps one per-element template μ
//     of normal appearance in trajectory space. For that model of normality the
//     optimal noise estimate is closed-form: `ε̂ = (x_t - √ρ·μ) / √(1-ρ)`. A
//     trajectory driven by it reconstructs the input pulled towards μ, so anything
//     the template has never seen stands out in the reconstruction distance.
// 3.  **Fitting**: `fit` learns μ by running averages over `epochs` passes. Each
//     visit also draws a random level and noise to compute the time-weighted
//     `1/(t+1)` noise-prediction loss. That loss is reported only; the update
//     itself never reads the draws.

use crate::core_modules::noise::{NoiseFactory, StreamPurpose};
use crate::core_modules::noise_scheduler::NoiseScheduler;
use crate::core_modules::tensor::tensor::{Tensor3, all_finite};
use crate::error::{InspectError, Result};
use serde::{Deserialize, Serialize};

/// Where on the schedule a prediction is requested.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffusionStep {
    /// Noise level in `0..=T`.
    pub level: usize,
    /// Signal retention ρ at that level.
    pub retention: f64,
}

pub trait NoisePredictor: Send + Sync {
    fn predict_noise(&self, x_t: &Tensor3, step: DiffusionStep) -> Tensor3;
}

/// Learned state of the template denoiser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateWeights {
    /// Normal appearance in trajectory space, shape (C, H, W).
    pub template: Tensor3,
}

/// Settings for `TemplateDenoiser::fit`.
#[derive(Debug, Clone, Copy)]
pub struct FitSettings {
    pub epochs: usize,
    pub learning_rate: f32,
}

/// Per-epoch time-weighted loss of a fit.
#[derive(Debug, Clone, Default)]
pub struct FitReport {
    pub epoch_losses: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct TemplateDenoiser {
    weights: TemplateWeights,
}

impl TemplateDenoiser {
    /// A denoiser with an all-zero template of the given shape.
    pub fn new(shape: (usize, usize, usize)) -> Self {
        Self {
            weights: TemplateWeights {
                template: Tensor3::zeros(shape),
            },
        }
    }

    pub fn from_weights(weights: TemplateWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &TemplateWeights {
        &self.weights
    }

    /// Learns the template from normal samples in trajectory space.
    ///
    /// The template update is a running average of the samples. The random level
    /// and ε drawn per visit feed only `FitReport::epoch_losses`, a diagnostic, so
    /// the fitted template does not depend on the noise seed.
    ///
    /// `after_update` runs after every template update; the pipeline uses it to
    /// advance the EMA shadow.
    #[tracing::instrument(skip_all, fields(samples = samples.len(), epochs = settings.epochs))]
    pub fn fit(
        &mut self,
        samples: &[Tensor3],
        scheduler: &NoiseScheduler,
        settings: FitSettings,
        noise: &NoiseFactory,
        mut after_update: impl FnMut(&TemplateWeights),
    ) -> Result<FitReport> {
        if samples.is_empty() {
            return Err(InspectError::data("denoiser fit needs at least one normal sample"));
        }
        let shape = self.weights.template.dim();
        for (index, sample) in samples.iter().enumerate() {
            if sample.dim() != shape {
                return Err(InspectError::data(format!(
                    "fit sample {index} has shape {:?}, expected {shape:?}",
                    sample.dim()
                )));
            }
            if !all_finite(sample) {
                return Err(InspectError::data(format!("fit sample {index} is not finite")));
            }
        }

        let mut report = FitReport::default();
        for epoch in 0..settings.epochs {
            let mut stream = noise.stream(StreamPurpose::DenoiserFit, epoch as u64);
            let mut weighted_loss = 0.0f64;
            for sample in samples {
                let level = stream.uniform_level(1, scheduler.num_steps());
                let eps = stream.noise_like(sample);
                let x_t = scheduler.forward_with(sample, level, &eps);
                let step = DiffusionStep {
                    level,
                    retention: scheduler.retention(level),
                };
                let predicted = self.predict_noise(&x_t, step);
                let mse = (&predicted - &eps).mapv(|d| (d as f64) * (d as f64)).mean().unwrap_or(0.0);
                weighted_loss += mse / (level as f64 + 1.0);

                let lr = settings.learning_rate;
                self.weights
                    .template
                    .zip_mut_with(sample, |mu, &x| *mu += lr * (x - *mu));
                after_update(&self.weights);
            }
            let mean_loss = weighted_loss / samples.len() as f64;
            tracing::debug!(epoch, loss = mean_loss, "denoiser epoch finished");
            report.epoch_losses.push(mean_loss);
        }
        tracing::info!(
            epochs = settings.epochs,
            final_loss = report.epoch_losses.last().copied().unwrap_or_default(),
            "denoiser template fitted"
        );
        Ok(report)
    }
}

impl NoisePredictor for TemplateDenoiser {
    fn predict_noise(&self, x_t: &Tensor3, step: DiffusionStep) -> Tensor3 {
        let rho = step.retention;
        if rho >= 1.0 {
            return Tensor3::zeros(x_t.raw_dim());
        }
        let signal = rho.sqrt() as f32;
        let inv_noise = 1.0 / (1.0 - rho).sqrt() as f32;
        let mut eps = x_t.clone();
        eps.scaled_add(-signal, &self.weights.template);
        eps *= inv_noise;
        eps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::noise::{NoiseKind, NoiseSource, SeedPolicy};
    use crate::core_modules::noise_scheduler::{ScheduleConfig, ScheduleKind};

    fn scheduler() -> NoiseScheduler {
        NoiseScheduler::new(&ScheduleConfig {
            trajectory_steps: 100,
            beta_start: 0.0001,
            beta_end: 0.02,
            kind: ScheduleKind::Linear,
        })
        .unwrap()
    }

    #[test]
    fn template_prediction_recovers_exact_noise() {
        let scheduler = scheduler();
        let template = Tensor3::from_shape_fn((1, 4, 4), |(_, y, x)| (y as f32 - x as f32) * 0.1);
        let denoiser = TemplateDenoiser::from_weights(TemplateWeights {
            template: template.clone(),
        });
        let mut noise = NoiseSource::from_seed(5, NoiseKind::Gaussian);
        let eps = noise.noise_like(&template);
        let x_t = scheduler.forward_with(&template, 60, &eps);
        let predicted = denoiser.predict_noise(
            &x_t,
            DiffusionStep {
                level: 60,
                retention: scheduler.retention(60),
            },
        );
        for (p, e) in predicted.iter().zip(eps.iter()) {
            assert!((p - e).abs() < 1e-3);
        }
    }

    #[test]
    fn fit_converges_to_sample_mean_and_calls_back() {
        let scheduler = scheduler();
        let samples = vec![Tensor3::from_elem((1, 2, 2), 0.4), Tensor3::from_elem((1, 2, 2), 0.6)];
        let mut denoiser = TemplateDenoiser::new((1, 2, 2));
        let factory = NoiseFactory::new(SeedPolicy::Fixed(3), NoiseKind::Gaussian);
        let mut updates = 0;
        let report = denoiser
            .fit(
                &samples,
                &scheduler,
                FitSettings {
                    epochs: 20,
                    learning_rate: 0.1,
                },
                &factory,
                |_| updates += 1,
            )
            .unwrap();
        assert_eq!(updates, 40);
        assert_eq!(report.epoch_losses.len(), 20);
        let mu = denoiser.weights().template[[0, 0, 0]];
        assert!((mu - 0.5).abs() < 0.05, "template {mu}");
    }

    #[test]
    fn template_does_not_depend_on_the_noise_seed() {
        let scheduler = scheduler();
        let samples = vec![
            Tensor3::from_elem((1, 2, 2), 0.2),
            Tensor3::from_shape_fn((1, 2, 2), |(_, y, x)| (y + x) as f32 * 0.3),
        ];
        let fit = |seed: u64| {
            let mut denoiser = TemplateDenoiser::new((1, 2, 2));
            let factory = NoiseFactory::new(SeedPolicy::Fixed(seed), NoiseKind::Gaussian);
            let settings = FitSettings {
                epochs: 3,
                learning_rate: 0.5,
            };
            let report = denoiser.fit(&samples, &scheduler, settings, &factory, |_| {}).unwrap();
            (denoiser.weights().template.clone(), report.epoch_losses)
        };
        let (template_a, losses_a) = fit(1);
        let (template_b, losses_b) = fit(2);
        assert_eq!(template_a, template_b);
        assert_ne!(losses_a, losses_b);
    }

    #[test]
    fn fit_rejects_mismatched_shapes() {
        let mut denoiser = TemplateDenoiser::new((1, 2, 2));
        let factory = NoiseFactory::new(SeedPolicy::Fixed(3), NoiseKind::Gaussian);
        let result = denoiser.fit(
            &[Tensor3::zeros((3, 2, 2))],
            &scheduler(),
            FitSettings {
                epochs: 1,
                learning_rate: 0.1,
            },
            &factory,
            |_| {},
        );
        assert!(matches!(result, Err(InspectError::Data(_))));
    }
}
