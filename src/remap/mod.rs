//! Undistort-rectify lookup tables and image resampling.
//!
//! A [`RemapTable`] stores, for every pixel of the rectified image, the
//! sub-pixel location to sample in the raw image. It is built once per camera
//! and resolution; [`remap`] is then a plain bilinear resampling pass.

use crate::camera::{RadTanModel, Resolution};
use crate::error::{Result, StereoError};
use image::{ImageBuffer, Pixel};
use nalgebra::{Matrix3, Matrix3x4, Vector2, Vector3};
use rayon::prelude::*;

/// Destination-to-source sampling coordinates, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RemapTable {
    pub width: u32,
    pub height: u32,
    /// Source column per destination pixel; NaN where the ray misses the camera.
    pub map_x: Vec<f32>,
    pub map_y: Vec<f32>,
}

impl RemapTable {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Source coordinates sampled for destination pixel `(x, y)`.
    pub fn source(&self, x: u32, y: u32) -> Option<Vector2<f32>> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let index = y as usize * self.width as usize + x as usize;
        let (sx, sy) = (self.map_x[index], self.map_y[index]);
        (sx.is_finite() && sy.is_finite()).then(|| Vector2::new(sx, sy))
    }
}

/// The rotation and camera part of a rectified projection, `P[:, :3] * R`.
fn rectified_camera(rotation: &Matrix3<f64>, projection: &Matrix3x4<f64>) -> Matrix3<f64> {
    projection.fixed_view::<3, 3>(0, 0).into_owned() * rotation
}

/// Builds the lookup table that undistorts and rectifies one camera.
///
/// Every destination pixel is back-projected through the rectified camera
/// `projection` and the inverse of `rotation` into the raw camera frame, then
/// pushed through the forward lens model to find the raw pixel to sample.
///
/// # Errors
///
/// [`StereoError::InvalidConfig`] for an empty image size and
/// [`StereoError::DegenerateGeometry`] if the rectified camera is singular.
pub fn build_remap(
    model: &RadTanModel,
    rotation: &Matrix3<f64>,
    projection: &Matrix3x4<f64>,
    image_size: Resolution,
) -> Result<RemapTable> {
    if image_size.width == 0 || image_size.height == 0 {
        return Err(StereoError::InvalidConfig(
            "remap table needs a non-empty image size".to_string(),
        ));
    }
    let inverse = rectified_camera(rotation, projection)
        .try_inverse()
        .ok_or_else(|| StereoError::DegenerateGeometry {
            reason: "rectified camera matrix is singular".to_string(),
            condition_number: f64::INFINITY,
        })?;

    let width = image_size.width as usize;
    let size = width * image_size.height as usize;
    let mut map_x = vec![f32::NAN; size];
    let mut map_y = vec![f32::NAN; size];

    map_x
        .par_chunks_mut(width)
        .zip(map_y.par_chunks_mut(width))
        .enumerate()
        .for_each(|(y, (row_x, row_y))| {
            for x in 0..width {
                let ray = inverse * Vector3::new(x as f64, y as f64, 1.0);
                if ray.z <= f64::EPSILON {
                    continue;
                }
                let source = model.normalized_to_pixel(&Vector2::new(ray.x / ray.z, ray.y / ray.z));
                row_x[x] = source.x as f32;
                row_y[x] = source.y as f32;
            }
        });

    Ok(RemapTable {
        width: image_size.width,
        height: image_size.height,
        map_x,
        map_y,
    })
}

/// Resamples `image` through `table` with bilinear interpolation.
///
/// Destination pixels whose source falls outside the raw image are black.
///
/// # Errors
///
/// [`StereoError::SizeMismatch`] if the image size differs from the table's.
pub fn remap<P>(
    image: &ImageBuffer<P, Vec<u8>>,
    table: &RemapTable,
) -> Result<ImageBuffer<P, Vec<u8>>>
where
    P: Pixel<Subpixel = u8> + Send + Sync,
{
    let (width, height) = image.dimensions();
    if (width, height) != (table.width, table.height) {
        return Err(StereoError::SizeMismatch {
            expected: (table.width, table.height),
            actual: (width, height),
        });
    }

    let channels = P::CHANNEL_COUNT as usize;
    let src = image.as_raw();
    let (w, h) = (width as usize, height as usize);
    let mut data = vec![0u8; w * h * channels];

    data.par_chunks_mut(w * channels)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..w {
                let index = y * w + x;
                let (sx, sy) = (table.map_x[index], table.map_y[index]);
                if !(sx >= 0.0 && sy >= 0.0 && sx <= (w - 1) as f32 && sy <= (h - 1) as f32) {
                    continue;
                }
                let x0 = sx.floor() as usize;
                let y0 = sy.floor() as usize;
                let x1 = (x0 + 1).min(w - 1);
                let y1 = (y0 + 1).min(h - 1);
                let fx = sx - x0 as f32;
                let fy = sy - y0 as f32;
                for c in 0..channels {
                    let at = |xx: usize, yy: usize| src[(yy * w + xx) * channels + c] as f32;
                    let top = at(x0, y0) * (1.0 - fx) + at(x1, y0) * fx;
                    let bottom = at(x0, y1) * (1.0 - fx) + at(x1, y1) * fx;
                    let value = top * (1.0 - fy) + bottom * fy;
                    row[x * channels + c] = value.round().clamp(0.0, 255.0) as u8;
                }
            }
        });

    Ok(ImageBuffer::from_raw(width, height, data).unwrap_or_else(|| ImageBuffer::new(width, height)))
}

/// Maps raw pixels of `model` into the rectified image given by `rotation`
/// and `projection`.
///
/// The lens distortion is inverted iteratively; points where the inversion
/// fails or that end up behind the rectified camera are `None`.
pub fn undistort_points(
    model: &RadTanModel,
    rotation: &Matrix3<f64>,
    projection: &Matrix3x4<f64>,
    points: &[Vector2<f64>],
) -> Vec<Option<Vector2<f64>>> {
    let camera = rectified_camera(rotation, projection);
    points
        .iter()
        .map(|pixel| {
            let normalized = model.pixel_to_normalized(pixel).ok()?;
            let q = camera * Vector3::new(normalized.x, normalized.y, 1.0);
            (q.z > f64::EPSILON).then(|| Vector2::new(q.x / q.z, q.y / q.z))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraModel, Intrinsics};
    use approx::assert_abs_diff_eq;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn model() -> RadTanModel {
        RadTanModel::from_parts(
            Intrinsics {
                fx: 200.0,
                fy: 205.0,
                cx: 80.0,
                cy: 61.0,
            },
            Resolution::new(160, 120),
            [-0.1, 0.02, 0.001, -0.0005, 0.0],
        )
    }

    fn pinhole_projection(model: &RadTanModel) -> Matrix3x4<f64> {
        let k = model.camera_matrix();
        Matrix3x4::from_fn(|r, c| if c < 3 { k[(r, c)] } else { 0.0 })
    }

    #[test]
    fn test_identity_table_for_pinhole() {
        let pinhole = RadTanModel::pinhole(model().intrinsics, Resolution::new(160, 120));
        let table = build_remap(
            &pinhole,
            &Matrix3::identity(),
            &pinhole_projection(&pinhole),
            pinhole.resolution,
        )
        .unwrap();
        let source = table.source(37, 90).unwrap();
        assert_abs_diff_eq!(source.x, 37.0, epsilon = 1e-3);
        assert_abs_diff_eq!(source.y, 90.0, epsilon = 1e-3);
        assert!(table.source(160, 0).is_none());
    }

    #[test]
    fn test_table_inverts_undistort_points() {
        let model = model();
        let rotation = crate::geometry::rodrigues(&Vector3::new(0.01, -0.02, 0.005));
        let projection = Matrix3x4::new(
            190.0, 0.0, 79.0, 0.0, //
            0.0, 190.0, 60.0, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        );
        let table = build_remap(&model, &rotation, &projection, model.resolution).unwrap();

        for (x, y) in [(20u32, 15u32), (80, 60), (140, 100)] {
            let source = table.source(x, y).unwrap();
            let raw = Vector2::new(source.x as f64, source.y as f64);
            let back = undistort_points(&model, &rotation, &projection, &[raw])[0].unwrap();
            assert_abs_diff_eq!(back.x, x as f64, epsilon = 1e-3);
            assert_abs_diff_eq!(back.y, y as f64, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_undistort_points_matches_projection() {
        let model = model();
        let projection = pinhole_projection(&model);
        let point = Vector3::new(0.1, -0.05, 1.0);
        let raw = model.project(&point).unwrap();
        let ideal = undistort_points(&model, &Matrix3::identity(), &projection, &[raw])[0].unwrap();
        assert_abs_diff_eq!(ideal.x, 200.0 * 0.1 + 80.0, epsilon = 1e-6);
        assert_abs_diff_eq!(ideal.y, 205.0 * -0.05 + 61.0, epsilon = 1e-6);
    }

    #[test]
    fn test_remap_shifts_and_blanks_outside() {
        let image = GrayImage::from_fn(8, 6, |x, _| Luma([(x * 20) as u8]));
        let mut table = RemapTable {
            width: 8,
            height: 6,
            map_x: vec![0.0; 48],
            map_y: vec![0.0; 48],
        };
        for y in 0..6 {
            for x in 0..8 {
                table.map_x[y * 8 + x] = x as f32 + 0.5;
                table.map_y[y * 8 + x] = y as f32;
            }
        }
        let out = remap(&image, &table).unwrap();
        assert_eq!(out.get_pixel(2, 3)[0], 50);
        assert_eq!(out.get_pixel(7, 3)[0], 0);
    }

    #[test]
    fn test_remap_color_and_size_check() {
        let image = RgbImage::from_pixel(4, 4, Rgb([10, 20, 30]));
        let table = RemapTable {
            width: 4,
            height: 4,
            map_x: vec![1.25; 16],
            map_y: vec![2.5; 16],
        };
        let out = remap(&image, &table).unwrap();
        assert_eq!(out.get_pixel(0, 0), &Rgb([10, 20, 30]));

        let small = RgbImage::new(3, 4);
        assert!(matches!(
            remap(&small, &table),
            Err(StereoError::SizeMismatch { .. })
        ));
    }
}
