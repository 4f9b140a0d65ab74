// THEORY:
// The `NoiseScheduler` owns the variance schedule of the diffusion process and the
// arithmetic that moves a sample along it. It is pure and immutable once built: every
// other module asks it "how much signal survives at level t?" and "which levels does
// a trajectory visit?".
//
// Key architectural principles:
// 1.  **Levels, not indices**: a noise level `t` runs over `0..=T`. Level 0 is the
//     clean image (retention 1); level `t >= 1` keeps `ᾱ[t-1]` of the signal. This
//     makes `forward_noise(x, 0)` an exact identity and gives trajectories a natural
//     terminal state.
// 2.  **Shape functions**: the schedule is `β = β_start + (β_end - β_start) · s(u)` for
//     `u` in [0, 1]. `linear` is `s(u) = u`, `sigmoid` is a logistic curve with slope 6
//     rescaled so it hits both bounds exactly. `scaled_linear` interpolates √β instead.
// 3.  **Stride rule**: `step_indices(start, skip)` visits `start`, then every multiple
//     of `skip` strictly below it, ending at 0. A non-dividing `skip` shortens the
//     first stride only.

use crate::core_modules::noise::NoiseSource;
use crate::core_modules::tensor::tensor::Tensor3;
use crate::error::{InspectError, Result};
use serde::{Deserialize, Serialize};

const SIGMOID_SLOPE: f64 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    #[default]
    Linear,
    ScaledLinear,
    Sigmoid,
}

/// Parameters of the variance schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    /// Total number of diffusion steps (T).
    pub trajectory_steps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub kind: ScheduleKind,
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.trajectory_steps < 2 {
            return Err(InspectError::config(format!(
                "trajectory_steps must be at least 2, got {}",
                self.trajectory_steps
            )));
        }
        if !self.beta_start.is_finite() || !self.beta_end.is_finite() {
            return Err(InspectError::config("beta bounds must be finite"));
        }
        if self.beta_start <= 0.0 {
            return Err(InspectError::config(format!(
                "beta_start must be > 0, got {}",
                self.beta_start
            )));
        }
        if self.beta_end >= 1.0 {
            return Err(InspectError::config(format!(
                "beta_end must be < 1, got {}",
                self.beta_end
            )));
        }
        if self.beta_start >= self.beta_end {
            return Err(InspectError::config(format!(
                "beta_start ({}) must be below beta_end ({})",
                self.beta_start, self.beta_end
            )));
        }
        let min_gap = self.trajectory_steps as f64 * f64::EPSILON;
        if self.beta_end - self.beta_start < min_gap {
            return Err(InspectError::config(format!(
                "beta_end - beta_start must be at least {min_gap:e} for {} steps",
                self.trajectory_steps
            )));
        }
        Ok(())
    }
}

/// Precomputed β, α and ᾱ for one schedule.
#[derive(Debug, Clone)]
pub struct NoiseScheduler {
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
}

impl NoiseScheduler {
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        config.validate()?;
        let steps = config.trajectory_steps;
        let last = (steps - 1) as f64;
        let betas: Vec<f64> = (0..steps)
            .map(|i| {
                let u = i as f64 / last;
                match config.kind {
                    ScheduleKind::Linear => {
                        config.beta_start + (config.beta_end - config.beta_start) * u
                    }
                    ScheduleKind::ScaledLinear => {
                        let (lo, hi) = (config.beta_start.sqrt(), config.beta_end.sqrt());
                        (lo + (hi - lo) * u).powi(2)
                    }
                    ScheduleKind::Sigmoid => {
                        config.beta_start
                            + (config.beta_end - config.beta_start) * rescaled_sigmoid(u)
                    }
                }
            })
            .collect();
        if let Some(i) = betas.windows(2).position(|w| w[0] >= w[1]) {
            return Err(InspectError::config(format!(
                "beta schedule is not strictly increasing at step {}; widen the beta bounds",
                i + 1
            )));
        }
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let alphas_cumprod = alphas
            .iter()
            .scan(1.0f64, |acc, a| {
                *acc *= a;
                Some(*acc)
            })
            .collect();
        tracing::debug!(
            steps,
            kind = ?config.kind,
            beta_start = config.beta_start,
            beta_end = config.beta_end,
            "noise schedule built"
        );
        Ok(Self {
            betas,
            alphas,
            alphas_cumprod,
        })
    }

    /// Number of diffusion steps T; valid levels are `0..=T`.
    pub fn num_steps(&self) -> usize {
        self.betas.len()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    /// Signal retention ρ(t): 1 at level 0, ᾱ[t-1] above. Levels past T clamp to T.
    pub fn retention(&self, level: usize) -> f64 {
        if level == 0 {
            1.0
        } else {
            self.alphas_cumprod[level.min(self.num_steps()) - 1]
        }
    }

    /// `x·√ρ(t) + ε·√(1-ρ(t))` with ε drawn from `noise`. Level 0 returns `x` unchanged.
    pub fn forward_noise(&self, x: &Tensor3, level: usize, noise: &mut NoiseSource) -> Tensor3 {
        if level == 0 {
            return x.clone();
        }
        let eps = noise.noise_like(x);
        self.forward_with(x, level, &eps)
    }

    /// Deterministic half of `forward_noise` for a given ε.
    pub fn forward_with(&self, x: &Tensor3, level: usize, eps: &Tensor3) -> Tensor3 {
        let rho = self.retention(level);
        let (a, b) = (rho.sqrt() as f32, (1.0 - rho).sqrt() as f32);
        let mut out = x * a;
        out.scaled_add(b, eps);
        out
    }

    /// Levels a reverse trajectory visits, in descending order: `start`, every multiple of
    /// `skip` below it, then 0.
    pub fn step_indices(&self, start: usize, skip: usize) -> Result<Vec<usize>> {
        if skip == 0 {
            return Err(InspectError::config("skip must be positive"));
        }
        if start > self.num_steps() {
            return Err(InspectError::config(format!(
                "trajectory start {start} exceeds trajectory_steps {}",
                self.num_steps()
            )));
        }
        let mut levels = vec![start];
        let below = if start == 0 { 0 } else { (start - 1) / skip };
        levels.extend((0..=below).rev().map(|k| k * skip).filter(|&l| l < start));
        Ok(levels)
    }
}

fn rescaled_sigmoid(u: f64) -> f64 {
    let logistic = |v: f64| 1.0 / (1.0 + (-SIGMOID_SLOPE * (2.0 * v - 1.0)).exp());
    let (lo, hi) = (logistic(0.0), logistic(1.0));
    (logistic(u) - lo) / (hi - lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::noise::NoiseKind;

    fn config(kind: ScheduleKind) -> ScheduleConfig {
        ScheduleConfig {
            trajectory_steps: 1000,
            beta_start: 0.0015,
            beta_end: 0.0195,
            kind,
        }
    }

    #[test]
    fn linear_schedule_hits_both_bounds() {
        let scheduler = NoiseScheduler::new(&config(ScheduleKind::Linear)).unwrap();
        assert_eq!(scheduler.num_steps(), 1000);
        assert!((scheduler.betas()[0] - 0.0015).abs() < 1e-12);
        assert!((scheduler.betas()[999] - 0.0195).abs() < 1e-12);
        assert!(scheduler.betas().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn every_kind_is_monotone_with_exact_bounds() {
        for kind in [ScheduleKind::Linear, ScheduleKind::ScaledLinear, ScheduleKind::Sigmoid] {
            let scheduler = NoiseScheduler::new(&config(kind)).unwrap();
            let betas = scheduler.betas();
            assert!((betas[0] - 0.0015).abs() < 1e-12, "{kind:?}");
            assert!((betas[999] - 0.0195).abs() < 1e-12, "{kind:?}");
            assert!(betas.windows(2).all(|w| w[0] < w[1]), "{kind:?}");
            assert!(scheduler.alphas_cumprod().windows(2).all(|w| w[0] > w[1]), "{kind:?}");
        }
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let mut bad = config(ScheduleKind::Linear);
        bad.beta_start = 0.0;
        assert!(matches!(NoiseScheduler::new(&bad), Err(InspectError::Config(_))));
        bad.beta_start = 0.03;
        assert!(NoiseScheduler::new(&bad).is_err());
        bad.beta_start = 0.001;
        bad.beta_end = 1.0;
        assert!(NoiseScheduler::new(&bad).is_err());
        bad.beta_end = f64::NAN;
        assert!(NoiseScheduler::new(&bad).is_err());
        let mut narrow = config(ScheduleKind::Sigmoid);
        narrow.beta_end = narrow.beta_start + 1e-15;
        assert!(matches!(NoiseScheduler::new(&narrow), Err(InspectError::Config(_))));
        let mut short = config(ScheduleKind::Linear);
        short.trajectory_steps = 1;
        assert!(NoiseScheduler::new(&short).is_err());
    }

    #[test]
    fn level_zero_is_identity() {
        let scheduler = NoiseScheduler::new(&config(ScheduleKind::Linear)).unwrap();
        let x = Tensor3::from_shape_fn((3, 4, 4), |(c, y, x)| (c + y * x) as f32 * 0.1);
        let mut noise = NoiseSource::from_seed(1, NoiseKind::Gaussian);
        assert_eq!(scheduler.forward_noise(&x, 0, &mut noise), x);
    }

    #[test]
    fn stride_visits_multiples_below_start() {
        let scheduler = NoiseScheduler::new(&config(ScheduleKind::Linear)).unwrap();
        let levels = scheduler.step_indices(80, 8).unwrap();
        assert_eq!(levels, vec![80, 72, 64, 56, 48, 40, 32, 24, 16, 8, 0]);
        let uneven = scheduler.step_indices(50, 20).unwrap();
        assert_eq!(uneven, vec![50, 40, 20, 0]);
        assert_eq!(scheduler.step_indices(0, 5).unwrap(), vec![0]);
        assert!(scheduler.step_indices(10, 0).is_err());
        assert!(scheduler.step_indices(1001, 10).is_err());
    }
}
