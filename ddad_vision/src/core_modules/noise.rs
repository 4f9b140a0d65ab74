// THEORY:
// Every stochastic draw in the engine (forward noising, stochastic reverse steps,
// noise-level sampling during domain adaptation, training-loss estimates) goes through
// a `NoiseSource`. Nothing reads ambient global randomness.
//
// Key architectural principles:
// 1.  **Explicit seeding**: a run is either `SeedPolicy::Fixed(seed)` or explicitly
//     `SeedPolicy::Unseeded`. The unseeded base seed is drawn from OS entropy once and
//     logged, so even an unseeded run can be replayed after the fact.
// 2.  **Per-sample streams**: a `NoiseFactory` derives an independent ChaCha stream for
//     each `(purpose, index)` pair. Sample 17 of an evaluation always sees the same
//     noise whether it ran first, last, or on another thread.
// 3.  **Noise kinds**: the distribution of ε is configurable. `adaptive_gaussian`
//     rescales its draws from the signal itself once the stream has a history.

use crate::core_modules::tensor::tensor::{Tensor3, std_dev};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

const ADAPTATION_RATE: f64 = 0.01;
const ADAPTIVE_MIN_STD: f64 = 0.01;
const ADAPTIVE_MAX_STD: f64 = 2.0;

/// The distribution ε is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseKind {
    #[default]
    Gaussian,
    /// Standard normal scaled by `clamp(0.01 * std(x), 0.01, 2.0)` after the first draw.
    AdaptiveGaussian,
    /// U[-1, 1].
    Uniform,
    /// Laplace(0, 1).
    Laplace,
    /// N(0, 1) or N(0, 4) with equal probability per element.
    Mixture,
}

/// How the run's randomness is seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedPolicy {
    Fixed(u64),
    Unseeded,
}

impl SeedPolicy {
    /// `-1` is the explicit "unseeded" marker; any other negative value is not a seed.
    pub fn from_config(seed: i64, manual_seed: bool) -> Option<Self> {
        match (seed, manual_seed) {
            (_, false) | (-1, _) => Some(Self::Unseeded),
            (s, true) if s >= 0 => Some(Self::Fixed(s as u64)),
            _ => None,
        }
    }
}

/// What a stream of noise is used for. Keeps streams of different phases disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPurpose {
    DenoiserFit = 1,
    Adaptation = 2,
    AdaptationLevels = 3,
    Evaluation = 4,
    Backbone = 5,
}

/// Hands out reproducible per-sample noise streams derived from one base seed.
#[derive(Debug, Clone)]
pub struct NoiseFactory {
    base_seed: u64,
    kind: NoiseKind,
}

impl NoiseFactory {
    pub fn new(policy: SeedPolicy, kind: NoiseKind) -> Self {
        let base_seed = match policy {
            SeedPolicy::Fixed(seed) => seed,
            SeedPolicy::Unseeded => {
                let seed = rand::rngs::OsRng.next_u64();
                tracing::warn!(base_seed = seed, "running unseeded; results are not reproducible");
                seed
            }
        };
        Self { base_seed, kind }
    }

    pub fn base_seed(&self) -> u64 {
        self.base_seed
    }

    pub fn kind(&self) -> NoiseKind {
        self.kind
    }

    /// The stream for `index` within `purpose`. Identical arguments yield identical draws.
    pub fn stream(&self, purpose: StreamPurpose, index: u64) -> NoiseSource {
        let mut rng = ChaCha8Rng::seed_from_u64(self.base_seed ^ ((purpose as u64) << 56));
        rng.set_stream(index);
        NoiseSource {
            rng,
            kind: self.kind,
            draws: 0,
        }
    }
}

/// A single deterministic stream of noise.
#[derive(Debug, Clone)]
pub struct NoiseSource {
    rng: ChaCha8Rng,
    kind: NoiseKind,
    draws: u64,
}

impl NoiseSource {
    pub fn from_seed(seed: u64, kind: NoiseKind) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            kind,
            draws: 0,
        }
    }

    /// ε with the same shape as `like`, drawn from the configured kind.
    pub fn noise_like(&mut self, like: &Tensor3) -> Tensor3 {
        let kind = self.kind;
        let scale = match kind {
            NoiseKind::AdaptiveGaussian if self.draws > 0 => {
                (std_dev(like) * ADAPTATION_RATE).clamp(ADAPTIVE_MIN_STD, ADAPTIVE_MAX_STD) as f32
            }
            _ => 1.0,
        };
        self.draws += 1;
        let rng = &mut self.rng;
        Tensor3::from_shape_simple_fn(like.raw_dim(), || match kind {
            NoiseKind::Gaussian | NoiseKind::AdaptiveGaussian => {
                let z: f32 = rng.sample(StandardNormal);
                z * scale
            }
            NoiseKind::Uniform => rng.gen_range(-1.0f32..1.0f32),
            NoiseKind::Laplace => {
                let u: f32 = rng.gen_range(-0.5f32..0.5f32);
                -u.signum() * (1.0 - 2.0 * u.abs()).max(f32::MIN_POSITIVE).ln()
            }
            NoiseKind::Mixture => {
                let z: f32 = rng.sample(StandardNormal);
                if rng.gen_range(0.0f32..1.0f32) > 0.5 { z } else { z * 2.0 }
            }
        })
    }

    /// Standard normal noise regardless of the configured kind (stochastic reverse steps).
    pub fn standard_normal_like(&mut self, like: &Tensor3) -> Tensor3 {
        let rng = &mut self.rng;
        Tensor3::from_shape_simple_fn(like.raw_dim(), || rng.sample::<f32, _>(StandardNormal))
    }

    /// Uniform integer in `low..=high`.
    pub fn uniform_level(&mut self, low: usize, high: usize) -> usize {
        self.rng.gen_range(low..=high)
    }

    /// Standard normal scalar, used for weight initialization.
    pub fn normal_scalar(&mut self) -> f32 {
        self.rng.sample(StandardNormal)
    }
}
