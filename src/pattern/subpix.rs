//! Sub-pixel refinement of chessboard corners.
//!
//! At a saddle point every image gradient in the neighbourhood is orthogonal
//! to the vector from the corner to the gradient's location. Each iteration
//! solves the weighted least-squares system `G q = b` built from the window
//! gradients, re-centers the window on `q` and repeats until the position
//! change drops below the epsilon or the iteration cap is reached.

use image::GrayImage;
use nalgebra::{Matrix2, Vector2};
use rayon::prelude::*;

/// Row-major `f32` copy of a grayscale image with clamped bilinear sampling.
#[derive(Debug, Clone)]
pub(crate) struct Raster {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl Raster {
    pub fn from_gray(image: &GrayImage) -> Self {
        Raster {
            width: image.width() as usize,
            height: image.height() as usize,
            data: image.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    #[inline]
    pub fn at(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.data[y * self.width + x]
    }

    pub fn sample(&self, x: f64, y: f64) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = (x - x0) as f32;
        let fy = (y - y0) as f32;
        let (ix, iy) = (x0 as isize, y0 as isize);
        let top = self.at(ix, iy) * (1.0 - fx) + self.at(ix + 1, iy) * fx;
        let bottom = self.at(ix, iy + 1) * (1.0 - fx) + self.at(ix + 1, iy + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Separable Gaussian blur with a kernel radius of `ceil(3 sigma)`.
    pub fn gaussian_blur(&self, sigma: f64) -> Raster {
        if sigma <= 0.0 {
            return self.clone();
        }
        let radius = (3.0 * sigma).ceil() as isize;
        let mut kernel: Vec<f32> = (-radius..=radius)
            .map(|i| (-(i * i) as f64 / (2.0 * sigma * sigma)).exp() as f32)
            .collect();
        let total: f32 = kernel.iter().sum();
        kernel.iter_mut().for_each(|k| *k /= total);

        let (w, h) = (self.width, self.height);
        let mut horizontal = vec![0.0f32; w * h];
        horizontal
            .par_chunks_mut(w)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, out) in row.iter_mut().enumerate() {
                    *out = kernel
                        .iter()
                        .enumerate()
                        .map(|(k, weight)| weight * self.at(x as isize + k as isize - radius, y as isize))
                        .sum();
                }
            });
        let horizontal = Raster {
            width: w,
            height: h,
            data: horizontal,
        };

        let mut vertical = vec![0.0f32; w * h];
        vertical.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                *out = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, weight)| {
                        weight * horizontal.at(x as isize, y as isize + k as isize - radius)
                    })
                    .sum();
            }
        });
        Raster {
            width: w,
            height: h,
            data: vertical,
        }
    }
}

/// Refines `corners` in place.
///
/// `half_window` of 5 gives the usual 11x11 window. A corner that wanders
/// further than the half window from its start is reset to the start.
pub(crate) fn refine_corners(
    raster: &Raster,
    corners: &mut [Vector2<f64>],
    half_window: usize,
    max_iterations: usize,
    epsilon: f64,
) {
    let win = half_window.max(1) as isize;
    let size = (2 * win + 1) as usize;
    let coeff = 1.0 / (win * win) as f64;
    let mask: Vec<f64> = (-win..=win)
        .map(|i| (-((i * i) as f64) * coeff).exp())
        .collect();
    let eps_sq = epsilon.max(0.0).powi(2);

    corners.par_iter_mut().for_each(|corner| {
        let start = *corner;
        let mut current = start;
        // window plus a one-pixel border for central differences
        let mut patch = vec![0.0f64; (size + 2) * (size + 2)];

        for _ in 0..max_iterations.max(1) {
            for (j, row) in patch.chunks_mut(size + 2).enumerate() {
                let y = current.y + (j as isize - win - 1) as f64;
                for (i, value) in row.iter_mut().enumerate() {
                    let x = current.x + (i as isize - win - 1) as f64;
                    *value = raster.sample(x, y) as f64;
                }
            }

            let mut g = Matrix2::zeros();
            let mut b = Vector2::zeros();
            for j in 0..size {
                let py = j as f64 - win as f64;
                for i in 0..size {
                    let px = i as f64 - win as f64;
                    let m = mask[i] * mask[j];
                    let at = |di: usize, dj: usize| patch[(j + dj) * (size + 2) + (i + di)];
                    let tx = at(2, 1) - at(0, 1);
                    let ty = at(1, 2) - at(1, 0);
                    let gxx = tx * tx * m;
                    let gxy = tx * ty * m;
                    let gyy = ty * ty * m;
                    g[(0, 0)] += gxx;
                    g[(0, 1)] += gxy;
                    g[(1, 1)] += gyy;
                    b.x += gxx * px + gxy * py;
                    b.y += gxy * px + gyy * py;
                }
            }
            g[(1, 0)] = g[(0, 1)];

            let Some(g_inv) = g.try_inverse() else {
                break;
            };
            let step = g_inv * b;
            current += step;
            if !current.x.is_finite() || !current.y.is_finite() {
                current = start;
                break;
            }
            if step.norm_squared() <= eps_sq {
                break;
            }
        }

        if (current - start).abs().max() > win as f64 {
            current = start;
        }
        *corner = current;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Anti-aliased X-junction centered at `(cx, cy)`.
    fn saddle_image(cx: f64, cy: f64) -> GrayImage {
        GrayImage::from_fn(40, 40, |x, y| {
            let mut sum = 0.0f64;
            for sy in 0..8 {
                for sx in 0..8 {
                    let u = x as f64 - 0.5 + (sx as f64 + 0.5) / 8.0 - cx;
                    let v = y as f64 - 0.5 + (sy as f64 + 0.5) / 8.0 - cy;
                    // rotate the junction by 0.3 rad
                    let (s, c) = 0.3f64.sin_cos();
                    let a = c * u + s * v;
                    let b = -s * u + c * v;
                    sum += if a * b > 0.0 { 220.0 } else { 35.0 };
                }
            }
            Luma([(sum / 64.0).round() as u8])
        })
    }

    #[test]
    fn test_refine_converges_to_saddle() {
        let image = saddle_image(19.37, 20.81);
        let raster = Raster::from_gray(&image);
        let mut corners = vec![Vector2::new(20.0, 21.0), Vector2::new(18.0, 20.0)];
        refine_corners(&raster, &mut corners, 5, 30, 0.001);
        for corner in corners {
            assert!((corner - Vector2::new(19.37, 20.81)).norm() < 0.05, "{:?}", corner);
        }
    }

    #[test]
    fn test_flat_patch_keeps_start() {
        let raster = Raster::from_gray(&GrayImage::from_pixel(20, 20, Luma([90])));
        let mut corners = vec![Vector2::new(10.0, 10.0)];
        refine_corners(&raster, &mut corners, 5, 30, 0.001);
        assert_eq!(corners[0], Vector2::new(10.0, 10.0));
    }

    #[test]
    fn test_gaussian_blur_preserves_mean() {
        let image = saddle_image(20.0, 20.0);
        let raster = Raster::from_gray(&image);
        let blurred = raster.gaussian_blur(1.5);
        let mean = |r: &Raster| r.data.iter().map(|&v| v as f64).sum::<f64>() / r.data.len() as f64;
        assert!((mean(&raster) - mean(&blurred)).abs() < 1.0);
        assert!((blurred.sample(20.0, 20.0) - raster.sample(20.0, 20.0)).abs() < 60.0);
    }
}
