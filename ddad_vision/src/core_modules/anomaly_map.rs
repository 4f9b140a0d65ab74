// THEORY:
// Anomaly-map fusion is the final analytical layer. It receives two independent
// opinions about every pixel and merges them into one calibrated map:
//
// - the **reconstruction map** `R`: how far the diffusion reconstruction is from the
//   input, in colour and in backbone feature space;
// - the **feature map** `F`: how far each patch of the input is from anything the
//   memory bank has seen.
//
// Key architectural principles:
// 1.  **Raw first, calibrate later**: per-sample work (`RawMapBuilder`) only produces
//     un-normalized maps at image resolution, optionally Gaussian-smoothed. It can
//     run in parallel and in any order.
// 2.  **Set-level normalization**: `MapFusion` fits one min-max normalizer for `R` and
//     one for `F` over the whole evaluation set, so scores are comparable across
//     samples. A degenerate (near-constant) set normalizes to zero.
// 3.  **Bounded output**: fused maps are `w·R_n + (1-w)·F_n` clamped to [0, 1], and the
//     image score is an aggregate of that map, so it is in [0, 1] too. With adaptive
//     fusion the pair `(w, 1-w)` is replaced per sample by a softmax over the mean
//     of each normalized map; the weights still sum to 1.
// 4.  **Detail enhancement** swaps the single blur of `R` for a blend of three scales
//     (σ/2, σ, 2σ weighted 0.3, 0.4, 0.3), keeping small defects visible.

use crate::core_modules::feature_backbone::FeatureStack;
use crate::core_modules::latent_codec::latent_distance;
use crate::core_modules::memory_bank::{DistanceMetric, patch_vectors};
use crate::core_modules::tensor::tensor::{
    Map, Tensor3, channel_mean_abs_diff, gaussian_blur, map_all_finite, resize_map,
};
use crate::error::{InspectError, Result};
use serde::{Deserialize, Serialize};

const DEGENERATE_RANGE: f32 = 1e-12;
const DETAIL_SCALES: [(f32, f32); 3] = [(0.5, 0.3), (1.0, 0.4), (2.0, 0.3)];

/// Un-normalized maps of one sample at image resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMaps {
    pub reconstruction: Map,
    pub feature: Map,
}

/// Everything one sample contributes to its raw maps.
pub struct MapInputs<'a> {
    pub input: &'a Tensor3,
    pub reconstruction: &'a Tensor3,
    /// Clean and denoised latents when the trajectory ran in latent space.
    pub latents: Option<(&'a Tensor3, &'a Tensor3)>,
    pub input_features: &'a FeatureStack,
    pub reconstruction_features: &'a FeatureStack,
    /// k-NN distance maps, one per retained layer.
    pub knn_maps: &'a [Map],
}

/// Per-sample raw map construction.
#[derive(Debug, Clone)]
pub struct RawMapBuilder {
    pub image_size: usize,
    /// Backbone layers that contribute to both maps.
    pub layers: Vec<usize>,
    pub eval_metric: DistanceMetric,
    /// Gaussian smoothing σ; 0 disables.
    pub sigma: f32,
    /// Multi-scale smoothing of the reconstruction map.
    pub detail_enhance: bool,
}

impl RawMapBuilder {
    pub fn build(&self, inputs: MapInputs<'_>) -> Result<RawMaps> {
        let size = self.image_size;

        let colour = match inputs.latents {
            Some((clean, denoised)) => resize_map(&latent_distance(clean, denoised), size, size),
            None => channel_mean_abs_diff(inputs.input, inputs.reconstruction),
        };
        let mut reconstruction = colour;
        for &layer in &self.layers {
            let (a, b) = match (inputs.input_features.get(layer), inputs.reconstruction_features.get(layer)) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(InspectError::data(format!("feature stack has no layer {layer}"))),
            };
            let distance = feature_distance_map(a, b, self.eval_metric)?;
            reconstruction += &resize_map(&distance, size, size);
        }

        if inputs.knn_maps.len() != self.layers.len() {
            return Err(InspectError::data(format!(
                "expected {} k-NN maps, got {}",
                self.layers.len(),
                inputs.knn_maps.len()
            )));
        }
        let mut feature = Map::zeros((size, size));
        for knn in inputs.knn_maps {
            feature += &resize_map(knn, size, size);
        }

        let reconstruction = if self.detail_enhance {
            multi_scale_blur(&reconstruction, self.sigma)
        } else {
            gaussian_blur(&reconstruction, self.sigma)
        };
        let feature = gaussian_blur(&feature, self.sigma);
        if !map_all_finite(&reconstruction) || !map_all_finite(&feature) {
            return Err(InspectError::NumericalFailure {
                step: 0,
                reason: "anomaly map is not finite".into(),
            });
        }
        Ok(RawMaps {
            reconstruction,
            feature,
        })
    }
}

/// Weighted sum of blurs at σ/2, σ and 2σ. σ = 0 leaves the map as is.
pub fn multi_scale_blur(map: &Map, sigma: f32) -> Map {
    if sigma <= 0.0 {
        return map.clone();
    }
    let mut out = Map::zeros(map.raw_dim());
    for (scale, weight) in DETAIL_SCALES {
        out.scaled_add(weight, &gaussian_blur(map, sigma * scale));
    }
    out
}

/// Per-position distance between two feature maps of the same shape.
pub fn feature_distance_map(a: &Tensor3, b: &Tensor3, metric: DistanceMetric) -> Result<Map> {
    if a.dim() != b.dim() {
        return Err(InspectError::data(format!(
            "feature maps differ in shape: {:?} vs {:?}",
            a.dim(),
            b.dim()
        )));
    }
    let (_, h, w) = a.dim();
    let (pa, pb) = (patch_vectors(a), patch_vectors(b));
    let values: Vec<f32> = pa
        .outer_iter()
        .zip(pb.outer_iter())
        .map(|(x, y)| metric.distance(x, y))
        .collect();
    Map::from_shape_vec((h, w), values).map_err(|e| InspectError::data(format!("feature distance map: {e}")))
}

/// Min-max scaling fit on a set of maps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMaxNormalizer {
    pub min: f32,
    pub max: f32,
}

impl MinMaxNormalizer {
    pub fn fit<'a>(maps: impl IntoIterator<Item = &'a Map>) -> Self {
        let (mut min, mut max) = (f32::INFINITY, f32::NEG_INFINITY);
        for map in maps {
            for &v in map.iter() {
                min = min.min(v);
                max = max.max(v);
            }
        }
        if !min.is_finite() || !max.is_finite() {
            return Self { min: 0.0, max: 0.0 };
        }
        Self { min, max }
    }

    pub fn apply(&self, map: &Map) -> Map {
        let range = self.max - self.min;
        if range <= DEGENERATE_RANGE {
            return Map::zeros(map.raw_dim());
        }
        map.mapv(|v| ((v - self.min) / range).clamp(0.0, 1.0))
    }
}

/// How a fused map collapses into an image score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreAggregate {
    #[default]
    Max,
    Mean,
    /// Mean of the `score_top_k` largest values.
    TopKMean,
}

impl ScoreAggregate {
    pub fn apply(self, map: &Map, top_k: usize) -> f32 {
        if map.is_empty() {
            return 0.0;
        }
        match self {
            Self::Max => map.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            Self::Mean => map.iter().sum::<f32>() / map.len() as f32,
            Self::TopKMean => {
                let k = top_k.clamp(1, map.len());
                let mut values: Vec<f32> = map.iter().copied().collect();
                values.sort_unstable_by(|a, b| b.total_cmp(a));
                values[..k].iter().sum::<f32>() / k as f32
            }
        }
    }
}

/// A calibrated map and its image score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedMap {
    pub map: Map,
    pub score: f32,
}

/// Softmax share of `r` over the pair of map means, temperature 1.
fn adaptive_weight(r: &Map, f: &Map) -> f32 {
    let (mr, mf) = (r.mean().unwrap_or(0.0), f.mean().unwrap_or(0.0));
    1.0 / (1.0 + (mf - mr).exp())
}

/// Normalizers fit on an evaluation set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionCalibration {
    pub reconstruction: MinMaxNormalizer,
    pub feature: MinMaxNormalizer,
}

#[derive(Debug, Clone, Copy)]
pub struct MapFusion {
    /// Weight of the reconstruction map, in [0, 1].
    pub weight: f32,
    pub aggregate: ScoreAggregate,
    pub top_k: usize,
    /// Per-sample softmax weights instead of `weight`.
    pub adaptive: bool,
}

impl MapFusion {
    pub fn calibrate(&self, raws: &[&RawMaps]) -> FusionCalibration {
        FusionCalibration {
            reconstruction: MinMaxNormalizer::fit(raws.iter().map(|r| &r.reconstruction)),
            feature: MinMaxNormalizer::fit(raws.iter().map(|r| &r.feature)),
        }
    }

    pub fn fuse_one(&self, raw: &RawMaps, calibration: &FusionCalibration) -> FusedMap {
        let r = calibration.reconstruction.apply(&raw.reconstruction);
        let f = calibration.feature.apply(&raw.feature);
        let w = if self.adaptive { adaptive_weight(&r, &f) } else { self.weight };
        let mut map = r * w;
        map.scaled_add(1.0 - w, &f);
        map.mapv_inplace(|v| v.clamp(0.0, 1.0));
        let score = self.aggregate.apply(&map, self.top_k).clamp(0.0, 1.0);
        FusedMap { map, score }
    }

    /// Calibrates on `raws` and fuses each of them.
    pub fn fuse(&self, raws: &[&RawMaps]) -> (FusionCalibration, Vec<FusedMap>) {
        let calibration = self.calibrate(raws);
        let fused = raws.iter().map(|raw| self.fuse_one(raw, &calibration)).collect();
        (calibration, fused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(r: f32, f: f32) -> RawMaps {
        RawMaps {
            reconstruction: Map::from_elem((4, 4), r),
            feature: Map::from_elem((4, 4), f),
        }
    }

    #[test]
    fn fused_maps_are_bounded_and_weighted() {
        let fusion = MapFusion {
            weight: 0.25,
            aggregate: ScoreAggregate::Max,
            top_k: 3,
            adaptive: false,
        };
        let mut hot = raw(10.0, 2.0);
        hot.reconstruction[[1, 1]] = 30.0;
        let cold = raw(0.0, 1.0);
        let (_, fused) = fusion.fuse(&[&hot, &cold]);
        for f in &fused {
            assert!(f.map.iter().all(|v| (0.0..=1.0).contains(v)));
            assert!((0.0..=1.0).contains(&f.score));
        }
        // At the hot pixel: R_n = 1, F_n = 1.
        assert!((fused[0].map[[1, 1]] - 1.0).abs() < 1e-6);
        // Elsewhere in the hot sample: R_n = 1/3, F_n = 1.
        assert!((fused[0].map[[0, 0]] - (0.25 / 3.0 + 0.75)).abs() < 1e-6);
        assert_eq!(fused[1].score, 0.0);
    }

    #[test]
    fn constant_set_normalizes_to_zero() {
        let fusion = MapFusion {
            weight: 0.5,
            aggregate: ScoreAggregate::Mean,
            top_k: 1,
            adaptive: false,
        };
        let (_, fused) = fusion.fuse(&[&raw(3.0, 3.0), &raw(3.0, 3.0)]);
        assert!(fused.iter().all(|f| f.score == 0.0));
    }

    #[test]
    fn adaptive_fusion_favours_the_hotter_map() {
        let fusion = MapFusion {
            weight: 0.0,
            aggregate: ScoreAggregate::Max,
            top_k: 1,
            adaptive: true,
        };
        // R_n is 1 everywhere on the hot sample, F_n is 0 there.
        let (_, fused) = fusion.fuse(&[&raw(5.0, 0.0), &raw(0.0, 2.0)]);
        let share = 1.0 / (1.0 + (-1.0f32).exp());
        assert!((fused[0].score - share).abs() < 1e-6);
        assert!((fused[1].score - share).abs() < 1e-6);
        assert!(fused.iter().all(|f| f.map.iter().all(|v| (0.0..=1.0).contains(v))));
    }

    #[test]
    fn detail_blend_keeps_mass_and_spreads_wider() {
        let mut spike = Map::zeros((17, 17));
        spike[[8, 8]] = 1.0;
        let single = gaussian_blur(&spike, 1.0);
        let blended = multi_scale_blur(&spike, 1.0);
        assert!((blended.sum() - single.sum()).abs() < 1e-4);
        assert!(blended[[8, 8]] > single[[8, 8]]);
        assert!(blended[[8, 14]] > single[[8, 14]]);
        assert_eq!(multi_scale_blur(&spike, 0.0), spike);
    }

    #[test]
    fn top_k_mean_averages_largest_values() {
        let map = Map::from_shape_vec((2, 2), vec![0.1, 0.9, 0.5, 0.7]).unwrap();
        assert!((ScoreAggregate::TopKMean.apply(&map, 2) - 0.8).abs() < 1e-6);
        assert_eq!(ScoreAggregate::Max.apply(&map, 2), 0.9);
        assert!((ScoreAggregate::Mean.apply(&map, 2) - 0.55).abs() < 1e-6);
    }

    #[test]
    fn mismatched_feature_layers_are_a_data_error() {
        let builder = RawMapBuilder {
            image_size: 8,
            layers: vec![1],
            eval_metric: DistanceMetric::L1,
            sigma: 0.0,
            detail_enhance: false,
        };
        let image = Tensor3::zeros((3, 8, 8));
        let features: FeatureStack = vec![Tensor3::zeros((2, 8, 8)), Tensor3::zeros((2, 4, 4))];
        let mut truncated = features.clone();
        truncated[1] = Tensor3::zeros((2, 2, 2));
        let result = builder.build(MapInputs {
            input: &image,
            reconstruction: &image,
            latents: None,
            input_features: &features,
            reconstruction_features: &truncated,
            knn_maps: &[Map::zeros((4, 4))],
        });
        assert!(matches!(result, Err(InspectError::Data(_))));
    }

    #[test]
    fn builder_sums_layers_and_upsamples() {
        let builder = RawMapBuilder {
            image_size: 8,
            layers: vec![1],
            eval_metric: DistanceMetric::L2,
            sigma: 0.0,
            detail_enhance: false,
        };
        let input = Tensor3::zeros((3, 8, 8));
        let reconstruction = Tensor3::from_elem((3, 8, 8), 0.5);
        let features: FeatureStack = vec![Tensor3::zeros((2, 8, 8)), Tensor3::zeros((2, 4, 4))];
        let mut shifted = features.clone();
        shifted[1].fill(1.0);
        let knn = vec![Map::from_elem((4, 4), 2.0)];
        let maps = builder
            .build(MapInputs {
                input: &input,
                reconstruction: &reconstruction,
                latents: None,
                input_features: &features,
                reconstruction_features: &shifted,
                knn_maps: &knn,
            })
            .unwrap();
        assert_eq!(maps.reconstruction.dim(), (8, 8));
        // colour 0.5 + l2 distance √2 on layer 1.
        assert!((maps.reconstruction[[3, 3]] - (0.5 + 2.0f32.sqrt())).abs() < 1e-5);
        assert!((maps.feature[[7, 7]] - 2.0).abs() < 1e-6);
    }
}
