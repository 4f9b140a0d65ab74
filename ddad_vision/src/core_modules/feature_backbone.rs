// THEORY:
// The `FeatureBackbone` turns an image into a stack of multi-scale activation maps,
// the representation both the k-NN scorer and the feature-reconstruction distance
// compare in. It is the "perception" layer of the engine: the diffusion trajectory
// decides *what* normal should look like, the backbone decides *how* two images are
// compared.
//
// Key architectural principles:
// 1.  **Pyramid**: layer 0 is a 3×3 convolution stem at full resolution. Every later
//     layer halves the resolution (2×2 average pooling) before its own 3×3
//     convolution, so layer `l` sees the image at `1 / 2^l` scale.
// 2.  **Normalized affine head**: each layer is `relu(γ · (z - μ) / √(σ² + ε) + β)`.
//     The convolution kernels are frozen after seeding; `γ`, `β` and the running
//     statistics `μ`, `σ²` are the only state domain adaptation may touch.
// 3.  **Calibration**: `calibrate` estimates every layer's running statistics from
//     normal images, bottom-up, so each layer is normalized against the distribution
//     its real inputs have.
// 4.  **Traceability**: `forward_detailed` exposes the normalized pre-affine
//     activations of every layer, which is exactly what the adapter's layer-local
//     gradients need.

use crate::core_modules::noise::NoiseSource;
use crate::core_modules::tensor::tensor::{Tensor3, avg_pool2};
use crate::error::{InspectError, Result};
use ndarray::{Array1, Array4, Axis, s};
use serde::{Deserialize, Serialize};

const BN_EPS: f32 = 1e-5;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const GRAY_MEAN: f32 = 0.449;
const GRAY_STD: f32 = 0.226;

/// One activation map per backbone layer, finest first.
pub type FeatureStack = Vec<Tensor3>;

/// A 3×3 convolution followed by a normalized per-channel affine and ReLU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvLayer {
    /// (out, in, 3, 3), frozen after initialization.
    pub kernel: Array4<f32>,
    pub bias: Array1<f32>,
    /// Per-channel scale, trainable.
    pub gamma: Array1<f32>,
    /// Per-channel shift, trainable.
    pub beta: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
}

impl ConvLayer {
    fn he_init(in_channels: usize, out_channels: usize, noise: &mut NoiseSource) -> Self {
        let std = (2.0 / (in_channels as f32 * 9.0)).sqrt();
        let kernel =
            Array4::from_shape_simple_fn((out_channels, in_channels, 3, 3), || noise.normal_scalar() * std);
        Self {
            kernel,
            bias: Array1::zeros(out_channels),
            gamma: Array1::ones(out_channels),
            beta: Array1::zeros(out_channels),
            running_mean: Array1::zeros(out_channels),
            running_var: Array1::ones(out_channels),
        }
    }

    pub fn out_channels(&self) -> usize {
        self.kernel.len_of(Axis(0))
    }

    pub fn in_channels(&self) -> usize {
        self.kernel.len_of(Axis(1))
    }

    /// Zero-padded 3×3 convolution plus bias.
    fn convolve(&self, input: &Tensor3) -> Tensor3 {
        let (_, h, w) = input.dim();
        let mut out = Tensor3::zeros((self.out_channels(), h, w));
        for (o, mut plane) in out.outer_iter_mut().enumerate() {
            plane.fill(self.bias[o]);
            for (i, source) in input.outer_iter().enumerate() {
                for ky in 0..3 {
                    for kx in 0..3 {
                        let weight = self.kernel[[o, i, ky, kx]];
                        let (dy, dx) = (ky as isize - 1, kx as isize - 1);
                        let (y0, y1) = (dy.min(0).unsigned_abs(), h - dy.max(0) as usize);
                        let (x0, x1) = (dx.min(0).unsigned_abs(), w - dx.max(0) as usize);
                        if y0 >= y1 || x0 >= x1 {
                            continue;
                        }
                        let src = source.slice(s![
                            (y0 as isize + dy) as usize..(y1 as isize + dy) as usize,
                            (x0 as isize + dx) as usize..(x1 as isize + dx) as usize
                        ]);
                        plane.slice_mut(s![y0..y1, x0..x1]).scaled_add(weight, &src);
                    }
                }
            }
        }
        out
    }

    fn normalize(&self, z: &Tensor3) -> Tensor3 {
        let mut n = z.clone();
        for (c, mut plane) in n.outer_iter_mut().enumerate() {
            let inv = 1.0 / (self.running_var[c] + BN_EPS).sqrt();
            let mean = self.running_mean[c];
            plane.mapv_inplace(|v| (v - mean) * inv);
        }
        n
    }

    fn affine(&self, n: &Tensor3) -> Tensor3 {
        let mut a = n.clone();
        for (c, mut plane) in a.outer_iter_mut().enumerate() {
            let (g, b) = (self.gamma[c], self.beta[c]);
            plane.mapv_inplace(|v| g * v + b);
        }
        a
    }
}

/// Everything that defines a backbone, serializable as part of `ModelState`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneWeights {
    pub input_channels: usize,
    pub layers: Vec<ConvLayer>,
}

/// Intermediate values of one layer for one image.
#[derive(Debug, Clone)]
pub struct LayerTrace {
    /// Pre-normalization convolution output.
    pub pre_norm: Tensor3,
    /// `(z - μ) / √(σ² + ε)`, before the affine.
    pub normalized: Tensor3,
    /// `γ·n + β`, before the ReLU.
    pub affine: Tensor3,
    /// Layer output after ReLU.
    pub output: Tensor3,
}

#[derive(Debug, Clone)]
pub struct FeatureBackbone {
    weights: BackboneWeights,
}

impl FeatureBackbone {
    /// Seeds frozen kernels for a pyramid with the given channel widths.
    pub fn new(input_channels: usize, channels: &[usize], noise: &mut NoiseSource) -> Result<Self> {
        if channels.is_empty() {
            return Err(InspectError::config("feature_channels must not be empty"));
        }
        if input_channels != 1 && input_channels != 3 {
            return Err(InspectError::config(format!(
                "backbone supports 1 or 3 input channels, got {input_channels}"
            )));
        }
        let mut layers = Vec::with_capacity(channels.len());
        let mut in_channels = input_channels;
        for &out in channels {
            layers.push(ConvLayer::he_init(in_channels, out, noise));
            in_channels = out;
        }
        Ok(Self {
            weights: BackboneWeights {
                input_channels,
                layers,
            },
        })
    }

    pub fn from_weights(weights: BackboneWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &BackboneWeights {
        &self.weights
    }

    pub fn num_layers(&self) -> usize {
        self.weights.layers.len()
    }

    /// Output resolution divisor of layer `l`.
    pub fn layer_stride(layer: usize) -> usize {
        1 << layer
    }

    /// Maps an image in [-1, 1] to the normalized input the stem expects.
    fn prepare(&self, image: &Tensor3) -> Tensor3 {
        let mut x = image.mapv(|v| (v + 1.0) * 0.5);
        let channels = x.len_of(Axis(0));
        for (c, mut plane) in x.outer_iter_mut().enumerate() {
            let (mean, std) = if channels == 3 {
                (IMAGENET_MEAN[c], IMAGENET_STD[c])
            } else {
                (GRAY_MEAN, GRAY_STD)
            };
            plane.mapv_inplace(|v| (v - mean) / std);
        }
        x
    }

    fn check_input(&self, image: &Tensor3) -> Result<()> {
        let (c, h, w) = image.dim();
        if c != self.weights.input_channels {
            return Err(InspectError::data(format!(
                "backbone expects {} channels, got {c}",
                self.weights.input_channels
            )));
        }
        let min = Self::layer_stride(self.num_layers().saturating_sub(1));
        if h < min || w < min {
            return Err(InspectError::data(format!(
                "image {h}x{w} is too small for {} backbone layers",
                self.num_layers()
            )));
        }
        Ok(())
    }

    /// Feature maps of every layer.
    pub fn forward(&self, image: &Tensor3) -> Result<FeatureStack> {
        Ok(self
            .forward_detailed(image)?
            .into_iter()
            .map(|trace| trace.output)
            .collect())
    }

    pub fn forward_detailed(&self, image: &Tensor3) -> Result<Vec<LayerTrace>> {
        self.check_input(image)?;
        let mut current = self.prepare(image);
        let mut traces = Vec::with_capacity(self.num_layers());
        for (index, layer) in self.weights.layers.iter().enumerate() {
            let input = if index == 0 { current } else { avg_pool2(&current) };
            let pre_norm = layer.convolve(&input);
            let normalized = layer.normalize(&pre_norm);
            let affine = layer.affine(&normalized);
            let output = affine.mapv(|v| v.max(0.0));
            current = output.clone();
            traces.push(LayerTrace {
                pre_norm,
                normalized,
                affine,
                output,
            });
        }
        Ok(traces)
    }

    /// Sets every layer's running statistics from a set of normal images, layer by layer.
    #[tracing::instrument(skip_all, fields(images = images.len()))]
    pub fn calibrate(&mut self, images: &[Tensor3]) -> Result<()> {
        if images.is_empty() {
            return Err(InspectError::data("backbone calibration needs at least one image"));
        }
        for image in images {
            self.check_input(image)?;
        }
        let mut activations: Vec<Tensor3> = images.iter().map(|img| self.prepare(img)).collect();
        for index in 0..self.num_layers() {
            let layer = &self.weights.layers[index];
            let pre: Vec<Tensor3> = activations
                .iter()
                .map(|x| {
                    let input = if index == 0 { x.clone() } else { avg_pool2(x) };
                    layer.convolve(&input)
                })
                .collect();
            let (mean, var) = channel_moments(&pre);
            let layer = &mut self.weights.layers[index];
            layer.running_mean = mean;
            layer.running_var = var;
            let layer = &self.weights.layers[index];
            activations = pre
                .iter()
                .map(|z| layer.affine(&layer.normalize(z)).mapv(|v| v.max(0.0)))
                .collect();
        }
        tracing::debug!(layers = self.num_layers(), "backbone running statistics calibrated");
        Ok(())
    }
}

/// Per-channel mean and population variance over a set of (C, H, W) maps.
pub fn channel_moments(maps: &[Tensor3]) -> (Array1<f32>, Array1<f32>) {
    let channels = maps.first().map_or(0, |m| m.len_of(Axis(0)));
    let mut sum = vec![0.0f64; channels];
    let mut sq = vec![0.0f64; channels];
    let mut count = 0usize;
    for map in maps {
        count += map.len_of(Axis(1)) * map.len_of(Axis(2));
        for (c, plane) in map.outer_iter().enumerate() {
            for &v in plane.iter() {
                sum[c] += v as f64;
                sq[c] += (v as f64) * (v as f64);
            }
        }
    }
    let n = count.max(1) as f64;
    let mean = Array1::from_iter(sum.iter().map(|s| (s / n) as f32));
    let var = Array1::from_iter(
        sum.iter()
            .zip(sq.iter())
            .map(|(s, q)| ((q / n) - (s / n).powi(2)).max(0.0) as f32),
    );
    (mean, var)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::noise::NoiseKind;

    fn backbone() -> FeatureBackbone {
        let mut noise = NoiseSource::from_seed(11, NoiseKind::Gaussian);
        FeatureBackbone::new(3, &[4, 6, 8], &mut noise).unwrap()
    }

    fn image(seed: u64) -> Tensor3 {
        let mut noise = NoiseSource::from_seed(seed, NoiseKind::Uniform);
        noise.noise_like(&Tensor3::zeros((3, 16, 16)))
    }

    #[test]
    fn pyramid_halves_resolution_per_layer() {
        let stack = backbone().forward(&image(1)).unwrap();
        assert_eq!(stack.len(), 3);
        assert_eq!(stack[0].dim(), (4, 16, 16));
        assert_eq!(stack[1].dim(), (6, 8, 8));
        assert_eq!(stack[2].dim(), (8, 4, 4));
        assert!(stack.iter().all(|f| f.iter().all(|v| *v >= 0.0)));
    }

    #[test]
    fn same_seed_gives_same_kernels() {
        assert_eq!(backbone().weights(), backbone().weights());
    }

    #[test]
    fn calibration_centres_pre_activations() {
        let mut net = backbone();
        let images: Vec<Tensor3> = (0..4).map(image).collect();
        net.calibrate(&images).unwrap();
        let traces: Vec<Vec<LayerTrace>> =
            images.iter().map(|img| net.forward_detailed(img).unwrap()).collect();
        let normalized: Vec<Tensor3> = traces.iter().map(|t| t[1].normalized.clone()).collect();
        let (mean, var) = channel_moments(&normalized);
        assert!(mean.iter().all(|m| m.abs() < 1e-3));
        assert!(var.iter().all(|v| (v - 1.0).abs() < 1e-2));
    }

    #[test]
    fn wrong_channel_count_is_a_data_error() {
        let net = backbone();
        let gray = Tensor3::zeros((1, 16, 16));
        assert!(matches!(net.forward(&gray), Err(InspectError::Data(_))));
    }

    #[test]
    fn identity_kernel_convolves_to_input() {
        let mut layer = ConvLayer::he_init(1, 1, &mut NoiseSource::from_seed(0, NoiseKind::Gaussian));
        layer.kernel.fill(0.0);
        layer.kernel[[0, 0, 1, 1]] = 1.0;
        let x = Tensor3::from_shape_fn((1, 3, 3), |(_, y, x)| (y * 3 + x) as f32);
        assert_eq!(layer.convolve(&x), x);
        layer.kernel[[0, 0, 1, 1]] = 0.0;
        layer.kernel[[0, 0, 1, 2]] = 1.0;
        let shifted = layer.convolve(&x);
        assert_eq!(shifted[[0, 0, 0]], 1.0);
        assert_eq!(shifted[[0, 0, 2]], 0.0);
    }
}
