// THEORY:
// The `tensor` module is the most fundamental unit of the engine. Like a pixel in a
// classic vision stack, it is a "dumb" container layer: a channel-first `f32` image
// (`Tensor3`, shape C×H×W) and a single-channel `Map` (H×W), plus the handful of
// whole-array helpers every higher module needs.
//
// Conventions (everything above this module relies on them):
// - Images live in [-1, 1]. Decoding maps 8-bit [0, 255] → [0, 1] → [-1, 1].
// - Maps are plain `Array2<f32>` at any resolution; `resize_map` brings them to a
//   common resolution with bilinear sampling and aligned corners.
// - Nothing here is random and nothing here keeps state between calls.
//
// What lives here: decode, resize, pool, blur, finiteness and norm checks. Anything that compares two tensors semantically belongs to the scorer
// modules, not here.

pub mod tensor {
    use crate::error::{InspectError, Result};
    use image::DynamicImage;
    use image::imageops::FilterType;
    use ndarray::{Array2, Array3, Axis, Zip};

    /// Channel-first image or latent, shape (C, H, W).
    pub type Tensor3 = Array3<f32>;
    /// Single-channel scalar grid, shape (H, W).
    pub type Map = Array2<f32>;

    /// Decodes an image into a `Tensor3` with `channels` channels at `size`×`size`.
    ///
    /// - 3 channels: RGB; alpha is dropped, grayscale sources are replicated.
    /// - 1 channel: luma.
    pub fn from_dynamic_image(image: &DynamicImage, channels: usize, size: u32) -> Result<Tensor3> {
        let resized = if image.width() == size && image.height() == size {
            image.clone()
        } else {
            image.resize_exact(size, size, FilterType::Triangle)
        };
        let side = size as usize;
        match channels {
            3 => {
                let rgb = resized.to_rgb32f();
                let mut tensor = Tensor3::zeros((3, side, side));
                for (x, y, pixel) in rgb.enumerate_pixels() {
                    for c in 0..3 {
                        tensor[[c, y as usize, x as usize]] = pixel.0[c] * 2.0 - 1.0;
                    }
                }
                Ok(tensor)
            }
            1 => {
                let luma = resized.to_luma32f();
                let mut tensor = Tensor3::zeros((1, side, side));
                for (x, y, pixel) in luma.enumerate_pixels() {
                    tensor[[0, y as usize, x as usize]] = pixel.0[0] * 2.0 - 1.0;
                }
                Ok(tensor)
            }
            other => Err(InspectError::data(format!(
                "unsupported channel count {other}, expected 1 or 3"
            ))),
        }
    }

    /// Decodes a ground-truth mask: any pixel above half intensity is anomalous.
    pub fn mask_from_dynamic_image(image: &DynamicImage, size: u32) -> Array2<bool> {
        let luma = image
            .resize_exact(size, size, FilterType::Nearest)
            .to_luma8();
        let side = size as usize;
        let mut mask = Array2::from_elem((side, side), false);
        for (x, y, pixel) in luma.enumerate_pixels() {
            mask[[y as usize, x as usize]] = pixel.0[0] > 127;
        }
        mask
    }

    /// Checks the (C, H, W) layout of an input against what the engine was configured for.
    pub fn check_shape(tensor: &Tensor3, channels: usize, size: usize) -> Result<()> {
        let (c, h, w) = tensor.dim();
        if c != channels {
            return Err(InspectError::data(format!(
                "expected {channels} channels, got {c}"
            )));
        }
        if h != size || w != size {
            return Err(InspectError::data(format!(
                "expected {size}x{size} input, got {h}x{w}"
            )));
        }
        Ok(())
    }

    pub fn all_finite(values: &Tensor3) -> bool {
        values.iter().all(|v| v.is_finite())
    }

    pub fn map_all_finite(values: &Map) -> bool {
        values.iter().all(|v| v.is_finite())
    }

    /// Frobenius norm, accumulated in f64.
    pub fn l2_norm(values: &Tensor3) -> f64 {
        values
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum::<f64>()
            .sqrt()
    }

    /// Population standard deviation over every element.
    pub fn std_dev(values: &Tensor3) -> f64 {
        let count = values.len() as f64;
        if count < 1.0 {
            return 0.0;
        }
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / count;
        let variance = values
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / count;
        variance.sqrt()
    }

    /// Mean absolute difference across channels: the colour-distance map between two tensors.
    pub fn channel_mean_abs_diff(a: &Tensor3, b: &Tensor3) -> Map {
        let channels = a.len_of(Axis(0)).max(1) as f32;
        let mut out = Map::zeros((a.len_of(Axis(1)), a.len_of(Axis(2))));
        for (plane_a, plane_b) in a.outer_iter().zip(b.outer_iter()) {
            Zip::from(&mut out)
                .and(&plane_a)
                .and(&plane_b)
                .for_each(|o, &x, &y| *o += (x - y).abs());
        }
        out.mapv_inplace(|v| v / channels);
        out
    }

    /// 2×2 average pooling. Odd trailing rows/columns are dropped.
    pub fn avg_pool2(tensor: &Tensor3) -> Tensor3 {
        let (c, h, w) = tensor.dim();
        let (oh, ow) = (h / 2, w / 2);
        let mut out = Tensor3::zeros((c, oh, ow));
        for ch in 0..c {
            for y in 0..oh {
                for x in 0..ow {
                    let sum = tensor[[ch, 2 * y, 2 * x]]
                        + tensor[[ch, 2 * y, 2 * x + 1]]
                        + tensor[[ch, 2 * y + 1, 2 * x]]
                        + tensor[[ch, 2 * y + 1, 2 * x + 1]];
                    out[[ch, y, x]] = sum * 0.25;
                }
            }
        }
        out
    }

    /// Bilinear resize with aligned corners.
    pub fn resize_map(map: &Map, height: usize, width: usize) -> Map {
        let (h, w) = map.dim();
        if h == height && w == width {
            return map.clone();
        }
        let scale_y = if height > 1 { (h as f32 - 1.0) / (height as f32 - 1.0) } else { 0.0 };
        let scale_x = if width > 1 { (w as f32 - 1.0) / (width as f32 - 1.0) } else { 0.0 };
        Map::from_shape_fn((height, width), |(y, x)| {
            let sy = y as f32 * scale_y;
            let sx = x as f32 * scale_x;
            let y0 = sy.floor() as usize;
            let x0 = sx.floor() as usize;
            let y1 = (y0 + 1).min(h - 1);
            let x1 = (x0 + 1).min(w - 1);
            let fy = sy - y0 as f32;
            let fx = sx - x0 as f32;
            let top = map[[y0, x0]] * (1.0 - fx) + map[[y0, x1]] * fx;
            let bottom = map[[y1, x0]] * (1.0 - fx) + map[[y1, x1]] * fx;
            top * (1.0 - fy) + bottom * fy
        })
    }

    /// Separable Gaussian blur with reflected borders.
    /// The kernel spans `2 * round(4σ) + 1` taps; `sigma <= 0` returns the input unchanged.
    pub fn gaussian_blur(map: &Map, sigma: f32) -> Map {
        if sigma <= 0.0 {
            return map.clone();
        }
        let radius = (4.0 * sigma + 0.5) as isize;
        let mut kernel: Vec<f32> = (-radius..=radius)
            .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
            .collect();
        let total: f32 = kernel.iter().sum();
        kernel.iter_mut().for_each(|k| *k /= total);

        let (h, w) = map.dim();
        let reflect = |i: isize, n: usize| -> usize {
            let n = n as isize;
            if n == 1 {
                return 0;
            }
            let period = 2 * (n - 1);
            let mut m = i.rem_euclid(period);
            if m >= n {
                m = period - m;
            }
            m as usize
        };

        let mut horizontal = Map::zeros((h, w));
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    let sx = reflect(x as isize + k as isize - radius, w);
                    acc += weight * map[[y, sx]];
                }
                horizontal[[y, x]] = acc;
            }
        }
        let mut out = Map::zeros((h, w));
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    let sy = reflect(y as isize + k as isize - radius, h);
                    acc += weight * horizontal[[sy, x]];
                }
                out[[y, x]] = acc;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::tensor::*;
    use image::{DynamicImage, Rgb, RgbImage};
    use ndarray::Array3;

    #[test]
    fn decode_maps_bytes_into_signed_unit_range() {
        let img = RgbImage::from_fn(4, 4, |x, _| if x < 2 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) });
        let tensor = from_dynamic_image(&DynamicImage::ImageRgb8(img), 3, 4).unwrap();
        assert_eq!(tensor.dim(), (3, 4, 4));
        assert_eq!(tensor[[0, 0, 0]], -1.0);
        assert_eq!(tensor[[2, 3, 3]], 1.0);
    }

    #[test]
    fn check_shape_rejects_wrong_channel_count() {
        let tensor = Array3::<f32>::zeros((1, 8, 8));
        assert!(check_shape(&tensor, 3, 8).is_err());
        assert!(check_shape(&tensor, 1, 8).is_ok());
    }

    #[test]
    fn resize_preserves_corners() {
        let map = Map::from_shape_vec((2, 2), vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let up = resize_map(&map, 5, 5);
        assert_eq!(up[[0, 0]], 0.0);
        assert_eq!(up[[0, 4]], 1.0);
        assert_eq!(up[[4, 0]], 2.0);
        assert_eq!(up[[4, 4]], 3.0);
        assert!((up[[2, 2]] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn blur_keeps_constant_maps_constant() {
        let map = Map::from_elem((9, 7), 0.25);
        let blurred = gaussian_blur(&map, 2.0);
        assert!(blurred.iter().all(|v| (v - 0.25).abs() < 1e-5));
    }

    #[test]
    fn avg_pool_halves_resolution() {
        let tensor = Array3::from_shape_fn((1, 4, 4), |(_, y, x)| (y * 4 + x) as f32);
        let pooled = avg_pool2(&tensor);
        assert_eq!(pooled.dim(), (1, 2, 2));
        assert_eq!(pooled[[0, 0, 0]], (0.0 + 1.0 + 4.0 + 5.0) / 4.0);
    }
}
