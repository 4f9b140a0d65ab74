// THEORY:
// A `LatentCodec` maps an image into the space the diffusion trajectory runs in and
// back. With `latent: false` that space is the image itself (`IdentityCodec`); with
// `latent: true` it is the low-frequency band of a single-level 2D Haar transform
// (`HaarCodec`), a quarter of the pixels.
//
// Key architectural principles:
// 1.  **Lossless when asked**: the Haar detail bands are kept in the `LatentCode`
//     when `latent_lossless` is set, so `decode(encode(x)) == x` up to float rounding.
// 2.  **Reconstruction drops details**: the trajectory only ever denoises the latent
//     band. `decode_latent` rebuilds an image from a latent alone, so high-frequency
//     defects in the input cannot leak into the reconstruction.
// 3.  **Same range**: the Haar latent is the 2×2 block mean, so it stays in [-1, 1]
//     and the noise schedule means the same thing in both spaces.

use crate::core_modules::tensor::tensor::Tensor3;
use crate::error::{InspectError, Result};
use ndarray::{Axis, s};

/// The encoded form of one image.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentCode {
    /// The band the trajectory denoises.
    pub latent: Tensor3,
    /// Residual needed for an exact decode, if the codec keeps it.
    pub details: Option<Tensor3>,
}

pub trait LatentCodec: Send + Sync {
    fn encode(&self, image: &Tensor3) -> Result<LatentCode>;

    /// Exact inverse of `encode` when the code carries its details.
    fn decode(&self, code: &LatentCode) -> Result<Tensor3>;

    /// Image from a latent alone.
    fn decode_latent(&self, latent: &Tensor3) -> Tensor3;

    /// Image side length divided by latent side length.
    fn downscale(&self) -> usize;
}

/// Trajectory runs directly in image space.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl LatentCodec for IdentityCodec {
    fn encode(&self, image: &Tensor3) -> Result<LatentCode> {
        Ok(LatentCode {
            latent: image.clone(),
            details: None,
        })
    }

    fn decode(&self, code: &LatentCode) -> Result<Tensor3> {
        Ok(code.latent.clone())
    }

    fn decode_latent(&self, latent: &Tensor3) -> Tensor3 {
        latent.clone()
    }

    fn downscale(&self) -> usize {
        1
    }
}

/// Single-level orthonormal Haar transform. The latent is half the LL band.
#[derive(Debug, Clone, Copy)]
pub struct HaarCodec {
    lossless: bool,
}

impl HaarCodec {
    pub fn new(lossless: bool) -> Self {
        Self { lossless }
    }
}

impl LatentCodec for HaarCodec {
    fn encode(&self, image: &Tensor3) -> Result<LatentCode> {
        let (c, h, w) = image.dim();
        if h % 2 != 0 || w % 2 != 0 {
            return Err(InspectError::data(format!(
                "haar codec needs even spatial size, got {h}x{w}"
            )));
        }
        let a = image.slice(s![.., ..;2, ..;2]);
        let b = image.slice(s![.., ..;2, 1..;2]);
        let cc = image.slice(s![.., 1..;2, ..;2]);
        let d = image.slice(s![.., 1..;2, 1..;2]);

        // LL / 2 is the block mean.
        let latent = (&a + &b + &cc + &d) * 0.25;
        let details = self.lossless.then(|| {
            let lh = (&a - &b + &cc - &d) * 0.5;
            let hl = (&a + &b - &cc - &d) * 0.5;
            let hh = (&a - &b - &cc + &d) * 0.5;
            let mut out = Tensor3::zeros((3 * c, h / 2, w / 2));
            out.slice_mut(s![..c, .., ..]).assign(&lh);
            out.slice_mut(s![c..2 * c, .., ..]).assign(&hl);
            out.slice_mut(s![2 * c.., .., ..]).assign(&hh);
            out
        });
        Ok(LatentCode { latent, details })
    }

    fn decode(&self, code: &LatentCode) -> Result<Tensor3> {
        let Some(details) = &code.details else {
            return Ok(self.decode_latent(&code.latent));
        };
        let (c, hh_, wh) = code.latent.dim();
        if details.dim() != (3 * c, hh_, wh) {
            return Err(InspectError::data(format!(
                "haar details have shape {:?}, expected {:?}",
                details.dim(),
                (3 * c, hh_, wh)
            )));
        }
        let ll = &code.latent * 2.0;
        let lh = details.slice(s![..c, .., ..]);
        let hl = details.slice(s![c..2 * c, .., ..]);
        let hh = details.slice(s![2 * c.., .., ..]);

        let mut out = Tensor3::zeros((c, 2 * hh_, 2 * wh));
        out.slice_mut(s![.., ..;2, ..;2])
            .assign(&((&ll + &lh + &hl + &hh) * 0.5));
        out.slice_mut(s![.., ..;2, 1..;2])
            .assign(&((&ll - &lh + &hl - &hh) * 0.5));
        out.slice_mut(s![.., 1..;2, ..;2])
            .assign(&((&ll + &lh - &hl - &hh) * 0.5));
        out.slice_mut(s![.., 1..;2, 1..;2])
            .assign(&((&ll - &lh - &hl + &hh) * 0.5));
        Ok(out)
    }

    fn decode_latent(&self, latent: &Tensor3) -> Tensor3 {
        let (c, h, w) = latent.dim();
        let mut out = Tensor3::zeros((c, 2 * h, 2 * w));
        for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            out.slice_mut(s![.., dy..;2, dx..;2]).assign(latent);
        }
        out
    }

    fn downscale(&self) -> usize {
        2
    }
}

/// Mean over the channel axis of `|a - b|` in latent space.
pub fn latent_distance(a: &Tensor3, b: &Tensor3) -> ndarray::Array2<f32> {
    let channels = a.len_of(Axis(0)).max(1) as f32;
    (a - b).mapv(f32::abs).sum_axis(Axis(0)) / channels
}
