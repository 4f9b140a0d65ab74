// THEORY:
// The `ReverseTrajectory` is the heart of the reconstruction half of the engine. It
// walks a noised sample back down the schedule, one visited level at a time, until
// it reaches the clean level 0. The walk is an explicit state machine: the caller
// can drive it step by step (`step`) or all the way (`run`), and every step either
// keeps it `Active` or finishes it with a `TrajectoryOutcome`.
//
// Key architectural principles:
// 1.  **Conditioned steps**: each step predicts the noise, then corrects it towards
//     the conditioning input `y` (the original, un-noised sample). The correction
//     weight is `eta2 · scale`, where `scale` adapts to the ratio of state norm to
//     predicted-noise norm. With `dynamic_steps` it is re-evaluated every step,
//     otherwise it is measured at the first step and frozen.
// 2.  **Stochasticity dial**: `eta = 0` gives a deterministic DDIM walk, `eta = 1`
//     a DDPM-equivalent one, values between blend the two. Standard normal draws
//     come only from the injected `NoiseSource`.
// 3.  **Abort, never poison**: if a prediction or a new state is not finite, the walk
//     stops with `Aborted`. A non-finite tensor is never handed to the caller.

use crate::core_modules::denoiser::{DiffusionStep, NoisePredictor};
use crate::core_modules::noise::NoiseSource;
use crate::core_modules::noise_scheduler::NoiseScheduler;
use crate::core_modules::tensor::tensor::{Tensor3, all_finite, l2_norm};
use crate::error::{InspectError, Result};
use std::fmt;

const SCALE_MIN: f64 = 0.5;
const SCALE_MAX: f64 = 1.5;
const SCALE_SENSITIVITY: f64 = 0.1;
const NORM_EPS: f64 = 1e-8;

/// Shape of one reverse walk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryParams {
    /// Level the walk starts from.
    pub start: usize,
    /// Stride between visited levels.
    pub skip: usize,
    /// Stochasticity: 0 = DDIM, 1 = DDPM.
    pub eta: f64,
    /// Strength of the pull towards the conditioning input.
    pub eta2: f64,
    /// Recompute the conditioning scale at every step.
    pub dynamic_steps: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    NonFinitePrediction,
    NonFiniteState,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonFinitePrediction => write!(f, "noise prediction is not finite"),
            Self::NonFiniteState => write!(f, "trajectory state is not finite"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TrajectoryOutcome {
    /// Reached level 0. `denoised` is the clean estimate.
    Completed { denoised: Tensor3, steps: usize },
    /// Stopped at noise level `step` without producing a usable state.
    Aborted { step: usize, reason: AbortReason },
}

impl TrajectoryOutcome {
    /// Converts an abort into `InspectError::NumericalFailure`.
    pub fn into_result(self) -> Result<Tensor3> {
        match self {
            Self::Completed { denoised, .. } => Ok(denoised),
            Self::Aborted { step, reason } => Err(InspectError::NumericalFailure {
                step,
                reason: reason.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TrajectoryState {
    /// Waiting to leave the given level.
    Active { level: usize },
    Done(TrajectoryOutcome),
}

pub struct ReverseTrajectory<'a> {
    scheduler: &'a NoiseScheduler,
    params: TrajectoryParams,
    levels: Vec<usize>,
    position: usize,
    state: Tensor3,
    condition: Tensor3,
    frozen_scale: Option<f64>,
}

impl<'a> ReverseTrajectory<'a> {
    /// Starts a walk from `x_start` (already noised to `params.start`) conditioned on `condition`.
    pub fn new(
        scheduler: &'a NoiseScheduler,
        params: TrajectoryParams,
        x_start: Tensor3,
        condition: Tensor3,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&params.eta) {
            return Err(InspectError::config(format!("eta must be in [0, 1], got {}", params.eta)));
        }
        if params.eta2 < 0.0 {
            return Err(InspectError::config(format!("eta2 must be >= 0, got {}", params.eta2)));
        }
        if x_start.dim() != condition.dim() {
            return Err(InspectError::data(format!(
                "trajectory state {:?} and condition {:?} differ in shape",
                x_start.dim(),
                condition.dim()
            )));
        }
        let levels = scheduler.step_indices(params.start, params.skip)?;
        Ok(Self {
            scheduler,
            params,
            levels,
            position: 0,
            state: x_start,
            condition,
            frozen_scale: None,
        })
    }

    /// Noises `clean` to `params.start` and starts a walk conditioned on it.
    pub fn from_clean(
        scheduler: &'a NoiseScheduler,
        params: TrajectoryParams,
        clean: &Tensor3,
        noise: &mut NoiseSource,
    ) -> Result<Self> {
        let x_start = scheduler.forward_noise(clean, params.start, noise);
        Self::new(scheduler, params, x_start, clean.clone())
    }

    pub fn levels(&self) -> &[usize] {
        &self.levels
    }

    pub fn current_level(&self) -> usize {
        self.levels[self.position]
    }

    fn conditioning_scale(&mut self, e: &Tensor3) -> f64 {
        if let (Some(scale), false) = (self.frozen_scale, self.params.dynamic_steps) {
            return scale;
        }
        let ratio = l2_norm(&self.state) / (l2_norm(e) + NORM_EPS);
        let scale = (SCALE_SENSITIVITY * ratio).tanh().clamp(SCALE_MIN, SCALE_MAX);
        if !self.params.dynamic_steps {
            self.frozen_scale = Some(scale);
        }
        scale
    }

    /// Advances one visited level.
    pub fn step(&mut self, predictor: &dyn NoisePredictor, noise: &mut NoiseSource) -> TrajectoryState {
        let t = self.current_level();
        if t == 0 || self.position + 1 >= self.levels.len() {
            return TrajectoryState::Done(TrajectoryOutcome::Completed {
                denoised: self.state.clone(),
                steps: self.position,
            });
        }
        let s = self.levels[self.position + 1];
        let rho_t = self.scheduler.retention(t);
        let rho_s = self.scheduler.retention(s);

        let e = predictor.predict_noise(
            &self.state,
            DiffusionStep {
                level: t,
                retention: rho_t,
            },
        );
        if e.dim() != self.state.dim() || !all_finite(&e) {
            tracing::debug!(level = t, "trajectory aborted on prediction");
            return TrajectoryState::Done(TrajectoryOutcome::Aborted {
                step: t,
                reason: AbortReason::NonFinitePrediction,
            });
        }

        let weight = self.params.eta2 * self.conditioning_scale(&e);
        let noise_t = (1.0 - rho_t).sqrt();

        // y_t = √ρt·y + √(1-ρt)·e
        let mut y_t = &self.condition * rho_t.sqrt() as f32;
        y_t.scaled_add(noise_t as f32, &e);
        // ê = e - √(1-ρt)·w·(y_t - x_t)
        let mut e_hat = e;
        let correction = &y_t - &self.state;
        e_hat.scaled_add(-(noise_t * weight) as f32, &correction);
        // x0 = (x_t - √(1-ρt)·ê) / √ρt
        let mut x0 = self.state.clone();
        x0.scaled_add(-noise_t as f32, &e_hat);
        x0 /= rho_t.sqrt() as f32;

        let c1 = self.params.eta * ((1.0 - rho_t / rho_s) * (1.0 - rho_s) / (1.0 - rho_t)).max(0.0).sqrt();
        let c2 = ((1.0 - rho_s) - c1 * c1).max(0.0).sqrt();

        let mut next = &x0 * rho_s.sqrt() as f32;
        if c1 > 0.0 {
            let z = noise.standard_normal_like(&x0);
            next.scaled_add(c1 as f32, &z);
        }
        next.scaled_add(c2 as f32, &e_hat);

        if !all_finite(&next) {
            tracing::debug!(level = t, "trajectory aborted on state");
            return TrajectoryState::Done(TrajectoryOutcome::Aborted {
                step: t,
                reason: AbortReason::NonFiniteState,
            });
        }
        self.state = next;
        self.position += 1;
        TrajectoryState::Active { level: s }
    }

    /// Drives the walk to its outcome.
    pub fn run(mut self, predictor: &dyn NoisePredictor, noise: &mut NoiseSource) -> TrajectoryOutcome {
        loop {
            if let TrajectoryState::Done(outcome) = self.step(predictor, noise) {
                return outcome;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::denoiser::{TemplateDenoiser, TemplateWeights};
    use crate::core_modules::noise::NoiseKind;
    use crate::core_modules::noise_scheduler::{ScheduleConfig, ScheduleKind};

    struct RecordingPredictor {
        levels: std::sync::Mutex<Vec<usize>>,
        poison_at: Option<usize>,
    }

    impl NoisePredictor for RecordingPredictor {
        fn predict_noise(&self, x_t: &Tensor3, step: DiffusionStep) -> Tensor3 {
            self.levels.lock().unwrap().push(step.level);
            if Some(step.level) == self.poison_at {
                Tensor3::from_elem(x_t.raw_dim(), f32::NAN)
            } else {
                Tensor3::zeros(x_t.raw_dim())
            }
        }
    }

    fn scheduler() -> NoiseScheduler {
        NoiseScheduler::new(&ScheduleConfig {
            trajectory_steps: 1000,
            beta_start: 0.0001,
            beta_end: 0.02,
            kind: ScheduleKind::Linear,
        })
        .unwrap()
    }

    fn params(eta: f64) -> TrajectoryParams {
        TrajectoryParams {
            start: 80,
            skip: 8,
            eta,
            eta2: 4.0,
            dynamic_steps: false,
        }
    }

    #[test]
    fn predictor_sees_every_visited_level_but_zero() {
        let scheduler = scheduler();
        let predictor = RecordingPredictor {
            levels: Default::default(),
            poison_at: None,
        };
        let clean = Tensor3::from_elem((1, 4, 4), 0.2);
        let mut noise = NoiseSource::from_seed(1, NoiseKind::Gaussian);
        let walk = ReverseTrajectory::from_clean(&scheduler, params(1.0), &clean, &mut noise).unwrap();
        assert_eq!(walk.levels().len(), 11);
        let outcome = walk.run(&predictor, &mut noise);
        assert!(matches!(outcome, TrajectoryOutcome::Completed { steps: 10, .. }));
        assert_eq!(
            *predictor.levels.lock().unwrap(),
            vec![80, 72, 64, 56, 48, 40, 32, 24, 16, 8]
        );
    }

    #[test]
    fn non_finite_prediction_aborts_at_its_level() {
        let scheduler = scheduler();
        let predictor = RecordingPredictor {
            levels: Default::default(),
            poison_at: Some(40),
        };
        let clean = Tensor3::from_elem((1, 4, 4), 0.2);
        let mut noise = NoiseSource::from_seed(1, NoiseKind::Gaussian);
        let walk = ReverseTrajectory::from_clean(&scheduler, params(1.0), &clean, &mut noise).unwrap();
        match walk.run(&predictor, &mut noise) {
            TrajectoryOutcome::Aborted { step, reason } => {
                assert_eq!(step, 40);
                assert_eq!(reason, AbortReason::NonFinitePrediction);
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(predictor.levels.lock().unwrap().last(), Some(&40));
    }

    #[test]
    fn deterministic_walk_reconstructs_the_template() {
        let scheduler = scheduler();
        let template = Tensor3::from_elem((1, 4, 4), 0.5);
        let denoiser = TemplateDenoiser::from_weights(TemplateWeights {
            template: template.clone(),
        });
        let mut noise = NoiseSource::from_seed(4, NoiseKind::Gaussian);
        let mut clean = template.clone();
        clean[[0, 1, 1]] = -0.8;
        let walk = ReverseTrajectory::from_clean(&scheduler, params(0.0), &clean, &mut noise).unwrap();
        let denoised = walk.run(&denoiser, &mut noise).into_result().unwrap();
        // Unseen content is pulled back towards the template; normal content stays.
        assert!((denoised[[0, 0, 0]] - 0.5).abs() < 0.05);
        assert!(denoised[[0, 1, 1]] > -0.8 + 0.5);
    }

    #[test]
    fn start_at_zero_completes_immediately() {
        let scheduler = scheduler();
        let clean = Tensor3::from_elem((1, 2, 2), 0.1);
        let mut noise = NoiseSource::from_seed(1, NoiseKind::Gaussian);
        let mut p = params(0.0);
        p.start = 0;
        let walk = ReverseTrajectory::from_clean(&scheduler, p, &clean, &mut noise).unwrap();
        let denoised = walk.run(&TemplateDenoiser::new((1, 2, 2)), &mut noise).into_result().unwrap();
        assert_eq!(denoised, clean);
    }

    #[test]
    fn eta_out_of_range_is_a_config_error() {
        let scheduler = scheduler();
        let x = Tensor3::zeros((1, 2, 2));
        let result = ReverseTrajectory::new(&scheduler, params(1.5), x.clone(), x);
        assert!(matches!(result, Err(InspectError::Config(_))));
    }
}
