// THEORY:
// The `MemoryBank` is the engine's long-term memory of "normal". Where a classic
// tracker matches a new observation against the things it has already seen, the
// `KnnScorer` matches every patch of a test image against every patch the bank
// collected from normal training images, and reports how far the closest ones are.
//
// Key architectural principles:
// 1.  **Immutable after build**: `MemoryBank::build` is the only writer. Afterwards
//     the bank is shared read-only behind an `Arc`, so any number of scoring threads
//     can query it without locks.
// 2.  **Stable order**: patch vectors are stored row by row in insertion order (image
//     order, then row-major position). Neighbour selection uses the total order on
//     `(distance, row)`, so equal distances always resolve to the earliest row and
//     scores never depend on the sort algorithm.
// 3.  **Clamped k**: asking for more neighbours than the bank holds uses the whole
//     bank. A single-vector bank therefore returns the distance to that vector for
//     every k.

use crate::core_modules::feature_backbone::FeatureStack;
use crate::core_modules::tensor::tensor::{Map, Tensor3};
use crate::error::{InspectError, Result};
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

const COSINE_EPS: f32 = 1e-8;

/// Distance between two patch vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    L1,
    #[default]
    L2,
    Cosine,
    /// `0.5 · l2 / √dim + 0.5 · (1 - cos)`.
    Combined,
}

impl DistanceMetric {
    pub fn distance(self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
        match self {
            Self::L1 => a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum(),
            Self::L2 => squared_l2(a, b).sqrt(),
            Self::Cosine => 1.0 - cosine_similarity(a, b),
            Self::Combined => {
                let dim = a.len().max(1) as f32;
                0.5 * squared_l2(a, b).sqrt() / dim.sqrt() + 0.5 * (1.0 - cosine_similarity(a, b))
            }
        }
    }
}

fn squared_l2(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Cosine similarity; a zero vector is treated as orthogonal to everything.
fn cosine_similarity(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let dot = a.dot(&b);
    let norms = a.dot(&a).sqrt() * b.dot(&b).sqrt();
    dot / norms.max(COSINE_EPS)
}

/// How the k nearest distances collapse to one score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnnAggregate {
    #[default]
    Mean,
    Max,
    Median,
}

impl KnnAggregate {
    /// `sorted` must be ascending and non-empty.
    fn apply(self, sorted: &[f32]) -> f32 {
        match self {
            Self::Mean => sorted.iter().sum::<f32>() / sorted.len() as f32,
            Self::Max => sorted[sorted.len() - 1],
            Self::Median => {
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    0.5 * (sorted[mid - 1] + sorted[mid])
                } else {
                    sorted[mid]
                }
            }
        }
    }
}

/// Patch vectors of normal images, one matrix per retained layer.
#[derive(Debug, Clone)]
pub struct MemoryBank {
    layers: Vec<usize>,
    /// Rows are patch vectors in insertion order.
    banks: Vec<Array2<f32>>,
}

/// Flattens a (C, H, W) map into H·W row vectors of length C.
pub fn patch_vectors(feature: &Tensor3) -> Array2<f32> {
    let (c, h, w) = feature.dim();
    let mut rows = Array2::zeros((h * w, c));
    for (channel, plane) in feature.outer_iter().enumerate() {
        for (row, &value) in plane.iter().enumerate() {
            rows[[row, channel]] = value;
        }
    }
    rows
}

impl MemoryBank {
    /// Collects the patch vectors of `layers` from every normal feature stack.
    #[tracing::instrument(skip_all, fields(images = stacks.len(), layers = ?layers))]
    pub fn build(stacks: &[FeatureStack], layers: &[usize]) -> Result<Self> {
        if stacks.is_empty() {
            return Err(InspectError::data("memory bank needs at least one normal image"));
        }
        if layers.is_empty() {
            return Err(InspectError::config("memory bank needs at least one layer"));
        }
        let mut banks = Vec::with_capacity(layers.len());
        for &layer in layers {
            let mut parts = Vec::with_capacity(stacks.len());
            for (index, stack) in stacks.iter().enumerate() {
                let feature = stack.get(layer).ok_or_else(|| {
                    InspectError::data(format!("feature stack {index} has no layer {layer}"))
                })?;
                parts.push(patch_vectors(feature));
            }
            let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
            let bank = ndarray::concatenate(Axis(0), &views)
                .map_err(|e| InspectError::data(format!("layer {layer} features disagree in width: {e}")))?;
            tracing::debug!(layer, vectors = bank.nrows(), dim = bank.ncols(), "memory bank layer built");
            banks.push(bank);
        }
        tracing::info!(
            layers = layers.len(),
            vectors = banks.iter().map(|b| b.nrows()).sum::<usize>(),
            "memory bank built"
        );
        Ok(Self {
            layers: layers.to_vec(),
            banks,
        })
    }

    /// Backbone layers the bank holds, in bank order.
    pub fn layers(&self) -> &[usize] {
        &self.layers
    }

    pub fn layer_bank(&self, layer: usize) -> Option<&Array2<f32>> {
        self.layers
            .iter()
            .position(|&l| l == layer)
            .map(|index| &self.banks[index])
    }

    pub fn len(&self) -> usize {
        self.banks.first().map_or(0, |b| b.nrows())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Nearest-neighbour distance scoring against a shared bank.
#[derive(Debug, Clone)]
pub struct KnnScorer {
    bank: Arc<MemoryBank>,
    k: usize,
    metric: DistanceMetric,
    aggregate: KnnAggregate,
}

impl KnnScorer {
    pub fn new(bank: Arc<MemoryBank>, k: usize, metric: DistanceMetric, aggregate: KnnAggregate) -> Result<Self> {
        if k == 0 {
            return Err(InspectError::config("knn_k must be at least 1"));
        }
        Ok(Self {
            bank,
            k,
            metric,
            aggregate,
        })
    }

    pub fn bank(&self) -> &Arc<MemoryBank> {
        &self.bank
    }

    /// Aggregated distance from `query` to its k nearest rows of `bank`.
    pub fn score_vector(&self, bank: &Array2<f32>, query: ArrayView1<f32>) -> f32 {
        let mut distances: Vec<(f32, usize)> = bank
            .outer_iter()
            .enumerate()
            .map(|(row, stored)| (self.metric.distance(query, stored), row))
            .collect();
        if distances.is_empty() {
            return 0.0;
        }
        let k = self.k.min(distances.len());
        let by_distance_then_row =
            |a: &(f32, usize), b: &(f32, usize)| -> Ordering { a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)) };
        if k < distances.len() {
            distances.select_nth_unstable_by(k - 1, by_distance_then_row);
            distances.truncate(k);
        }
        distances.sort_unstable_by(by_distance_then_row);
        let nearest: Vec<f32> = distances.iter().map(|(d, _)| *d).collect();
        self.aggregate.apply(&nearest)
    }

    /// One distance map per bank layer, each at that layer's resolution.
    pub fn score_map(&self, stack: &FeatureStack) -> Result<Vec<Map>> {
        let mut maps = Vec::with_capacity(self.bank.layers.len());
        for (&layer, bank) in self.bank.layers.iter().zip(self.bank.banks.iter()) {
            let feature = stack
                .get(layer)
                .ok_or_else(|| InspectError::data(format!("query has no layer {layer}")))?;
            let (c, h, w) = feature.dim();
            if c != bank.ncols() {
                return Err(InspectError::data(format!(
                    "layer {layer} has {c} channels, bank holds {}",
                    bank.ncols()
                )));
            }
            let queries = patch_vectors(feature);
            let values: Vec<f32> = queries
                .outer_iter()
                .map(|query| self.score_vector(bank, query))
                .collect();
            let map = Map::from_shape_vec((h, w), values)
                .map_err(|e| InspectError::data(format!("layer {layer} map shape: {e}")))?;
            maps.push(map);
        }
        Ok(maps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, array};

    fn stack_of(vectors: &[[f32; 2]]) -> FeatureStack {
        // Layer 0 is unused; layer 1 holds the vectors as a 1×N map.
        let n = vectors.len();
        let feature = Tensor3::from_shape_fn((2, 1, n), |(c, _, x)| vectors[x][c]);
        vec![Tensor3::zeros((1, 1, 1)), feature]
    }

    #[test]
    fn single_vector_bank_ignores_k() {
        let bank = Arc::new(MemoryBank::build(&[stack_of(&[[3.0, 4.0]])], &[1]).unwrap());
        let stored = bank.layer_bank(1).unwrap().clone();
        for k in [1, 2, 50] {
            let scorer = KnnScorer::new(bank.clone(), k, DistanceMetric::L2, KnnAggregate::Mean).unwrap();
            let d = scorer.score_vector(&stored, array![0.0f32, 0.0].view());
            assert!((d - 5.0).abs() < 1e-6);
        }
    }

    #[test]
    fn k_one_is_strict_nearest_neighbour() {
        let bank = Arc::new(MemoryBank::build(&[stack_of(&[[0.0, 0.0], [10.0, 0.0], [1.0, 0.0]])], &[1]).unwrap());
        let stored = bank.layer_bank(1).unwrap().clone();
        let scorer = KnnScorer::new(bank.clone(), 1, DistanceMetric::L2, KnnAggregate::Mean).unwrap();
        let d = scorer.score_vector(&stored, array![0.9f32, 0.0].view());
        assert!((d - 0.1).abs() < 1e-6);
    }

    #[test]
    fn aggregates_over_k_nearest() {
        let bank = Arc::new(
            MemoryBank::build(&[stack_of(&[[1.0, 0.0], [2.0, 0.0], [4.0, 0.0], [100.0, 0.0]])], &[1]).unwrap(),
        );
        let stored = bank.layer_bank(1).unwrap().clone();
        let query = array![0.0f32, 0.0];
        let score = |aggregate| {
            KnnScorer::new(bank.clone(), 3, DistanceMetric::L2, aggregate)
                .unwrap()
                .score_vector(&stored, query.view())
        };
        assert!((score(KnnAggregate::Mean) - 7.0 / 3.0).abs() < 1e-6);
        assert_eq!(score(KnnAggregate::Max), 4.0);
        assert_eq!(score(KnnAggregate::Median), 2.0);
    }

    #[test]
    fn score_map_is_deterministic_and_shaped() {
        let bank = Arc::new(MemoryBank::build(&[stack_of(&[[1.0, 1.0], [0.0, 2.0]])], &[1]).unwrap());
        let scorer = KnnScorer::new(bank, 2, DistanceMetric::Combined, KnnAggregate::Mean).unwrap();
        let query = stack_of(&[[0.5, 0.5], [3.0, -1.0], [1.0, 1.0]]);
        let first = scorer.score_map(&query).unwrap();
        let second = scorer.score_map(&query).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].dim(), (1, 3));
    }

    #[test]
    fn cosine_and_combined_metrics() {
        let a = Array1::from(vec![1.0f32, 0.0]);
        let b = Array1::from(vec![0.0f32, 2.0]);
        assert!((DistanceMetric::Cosine.distance(a.view(), b.view()) - 1.0).abs() < 1e-6);
        assert_eq!(DistanceMetric::Cosine.distance(a.view(), a.view()), 0.0);
        let combined = DistanceMetric::Combined.distance(a.view(), b.view());
        let expected = 0.5 * 5.0f32.sqrt() / 2.0f32.sqrt() + 0.5;
        assert!((combined - expected).abs() < 1e-6);
        assert_eq!(DistanceMetric::L1.distance(a.view(), b.view()), 3.0);
    }

    #[test]
    fn k_zero_is_rejected() {
        let bank = Arc::new(MemoryBank::build(&[stack_of(&[[1.0, 1.0]])], &[1]).unwrap());
        assert!(KnnScorer::new(bank, 0, DistanceMetric::L2, KnnAggregate::Mean).is_err());
    }
}
