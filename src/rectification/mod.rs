//! Row-aligning rectification of a calibrated rig.
//!
//! The relative rotation is split in half and applied in opposite directions
//! to the two cameras, then a common rotation turns the baseline onto the
//! image x axis (y axis for vertical rigs). Both rectified cameras share one
//! focal length and principal point, so the only difference between `P1` and
//! `P2` is the baseline term in the last column and corresponding points end
//! up on the same image row.

use crate::camera::{RadTanModel, Resolution};
use crate::error::{Result, StereoError};
use crate::geometry::{rodrigues, rotation_log};
use crate::optimization::StereoExtrinsics;
use crate::remap::{build_remap, undistort_points, RemapTable};
use crate::stereo::DisparityMap;
use log::info;
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector2, Vector3, Vector4};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Samples per image side used to trace the rectified image border.
const BORDER_SAMPLES: usize = 9;

/// Integer pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl PixelRect {
    fn clip(self, size: Resolution) -> PixelRect {
        let x0 = self.x.max(0);
        let y0 = self.y.max(0);
        let x1 = (self.x + self.width).min(size.width as i32);
        let y1 = (self.y + self.height).min(size.height as i32);
        PixelRect {
            x: x0,
            y: y0,
            width: (x1 - x0).max(0),
            height: (y1 - y0).max(0),
        }
    }

    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }
}

/// Axis-aligned bounds in rectified pixels.
#[derive(Debug, Clone, Copy)]
struct Bounds {
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
}

/// Rectifying rotations, projections and the disparity-to-depth matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectificationModel {
    pub r1: Matrix3<f64>,
    pub r2: Matrix3<f64>,
    pub p1: Matrix3x4<f64>,
    pub p2: Matrix3x4<f64>,
    /// Maps `[x, y, d, 1]` in the left rectified image to homogeneous 3D.
    pub q: Matrix4<f64>,
    pub image_size: Resolution,
    /// Region of the left rectified image where every pixel is valid.
    pub roi_left: PixelRect,
    pub roi_right: PixelRect,
}

impl RectificationModel {
    /// Computes the rectification of a calibrated rig.
    ///
    /// `alpha` in `[0, 1]` selects between cropping to the region valid in
    /// both images (0) and keeping every source pixel (1). Values outside the
    /// range are clamped.
    ///
    /// # Errors
    ///
    /// * [`StereoError::SizeMismatch`] if a model was calibrated at another size.
    /// * [`StereoError::InvalidConfig`] for a non-finite `alpha` or an empty
    ///   image size.
    /// * [`StereoError::DegenerateGeometry`] for a zero baseline or when the
    ///   rectified image border cannot be traced.
    pub fn build(
        left: &RadTanModel,
        right: &RadTanModel,
        extrinsics: &StereoExtrinsics,
        image_size: Resolution,
        alpha: f64,
    ) -> Result<Self> {
        if image_size.width == 0 || image_size.height == 0 {
            return Err(StereoError::InvalidConfig(
                "rectification needs a non-empty image size".to_string(),
            ));
        }
        for model in [left, right] {
            if model.resolution != image_size {
                return Err(StereoError::SizeMismatch {
                    expected: (image_size.width, image_size.height),
                    actual: (model.resolution.width, model.resolution.height),
                });
            }
        }
        if !alpha.is_finite() {
            return Err(StereoError::InvalidConfig(format!(
                "rectification alpha must be finite, got {}",
                alpha
            )));
        }
        let alpha = alpha.clamp(0.0, 1.0);

        // half of the inverse relative rotation
        let r_half = rodrigues(&(rotation_log(&extrinsics.rotation) * -0.5));
        let t = r_half * extrinsics.translation;
        let idx = if t.x.abs() > t.y.abs() { 0 } else { 1 };
        let c = t[idx];
        let nt = t.norm();
        if !(nt > f64::EPSILON) {
            return Err(StereoError::DegenerateGeometry {
                reason: "stereo baseline is zero".to_string(),
                condition_number: f64::INFINITY,
            });
        }

        let mut axis = Vector3::zeros();
        axis[idx] = if c > 0.0 { 1.0 } else { -1.0 };
        let mut w = t.cross(&axis);
        let nw = w.norm();
        if nw > 0.0 {
            w *= (c.abs() / nt).clamp(-1.0, 1.0).acos() / nw;
        }
        let w_r = rodrigues(&w);
        let r1 = w_r * r_half.transpose();
        let r2 = w_r * r_half;
        let t_rect = r2 * extrinsics.translation;

        let (nx, ny) = (image_size.width as f64, image_size.height as f64);
        let mut fc = f64::MAX;
        for model in [left, right] {
            let k1 = model.distortions[0];
            let mut f = if idx == 0 {
                model.intrinsics.fy
            } else {
                model.intrinsics.fx
            };
            if k1 < 0.0 {
                f *= 1.0 + k1 * (nx * nx + ny * ny) / (4.0 * f * f);
            }
            fc = fc.min(f);
        }

        let centers = [
            principal_point(left, &r1, fc, image_size)?,
            principal_point(right, &r2, fc, image_size)?,
        ];
        // both cameras share the principal point so zero disparity is at infinity
        let cc = (centers[0] + centers[1]) * 0.5;

        let unscaled = projection(fc, &cc);
        let (inner_left, outer_left) = border_bounds(left, &r1, &unscaled, image_size)?;
        let (inner_right, outer_right) = border_bounds(right, &r2, &unscaled, image_size)?;

        let (cx, cy) = (cc.x, cc.y);
        let shrink = |b: &Bounds| {
            (cx / (cx - b.x0))
                .max(cy / (cy - b.y0))
                .max((nx - cx) / (b.x1 - cx))
                .max((ny - cy) / (b.y1 - cy))
        };
        let expand = |b: &Bounds| {
            (cx / (cx - b.x0))
                .min(cy / (cy - b.y0))
                .min((nx - cx) / (b.x1 - cx))
                .min((ny - cy) / (b.y1 - cy))
        };
        let s0 = shrink(&inner_left).max(shrink(&inner_right));
        let s1 = expand(&outer_left).min(expand(&outer_right));
        let s = s0 * (1.0 - alpha) + s1 * alpha;
        if !(s > 0.0 && s.is_finite()) {
            return Err(StereoError::DegenerateGeometry {
                reason: format!("rectified field of view scale is invalid ({})", s),
                condition_number: f64::INFINITY,
            });
        }
        let fc = fc * s;

        let roi = |b: &Bounds| {
            PixelRect {
                x: ((b.x0 - cx) * s + cx).ceil() as i32,
                y: ((b.y0 - cy) * s + cy).ceil() as i32,
                width: ((b.x1 - b.x0) * s).floor() as i32,
                height: ((b.y1 - b.y0) * s).floor() as i32,
            }
            .clip(image_size)
        };

        let p1 = projection(fc, &cc);
        let mut p2 = projection(fc, &cc);
        let tx = t_rect[idx];
        p2[(idx, 3)] = tx * fc;

        #[rustfmt::skip]
        let q = Matrix4::new(
            1.0, 0.0, 0.0, -cc.x,
            0.0, 1.0, 0.0, -cc.y,
            0.0, 0.0, 0.0, fc,
            0.0, 0.0, -1.0 / tx, 0.0,
        );

        info!(
            "rectified focal length {:.3}, principal point ({:.3}, {:.3}), baseline {:.5}",
            fc,
            cc.x,
            cc.y,
            tx.abs()
        );

        Ok(RectificationModel {
            r1,
            r2,
            p1,
            p2,
            q,
            image_size,
            roi_left: roi(&inner_left),
            roi_right: roi(&inner_right),
        })
    }

    /// Shared focal length of the rectified cameras, in pixels.
    pub fn focal_length(&self) -> f64 {
        self.q[(2, 3)]
    }

    /// Distance between the rectified camera centers, in calibration units.
    pub fn baseline(&self) -> f64 {
        (1.0 / self.q[(3, 2)]).abs()
    }

    /// Left-camera rectified 3D point of pixel `(x, y)` with disparity `d`.
    ///
    /// `None` when the disparity is not positive, since such a point lies at
    /// or beyond infinity.
    pub fn reproject(&self, x: f64, y: f64, d: f64) -> Option<Vector3<f64>> {
        if !(d > 0.0) {
            return None;
        }
        let h = self.q * Vector4::new(x, y, d, 1.0);
        if !(h.w > f64::EPSILON) {
            return None;
        }
        let point = Vector3::new(h.x / h.w, h.y / h.w, h.z / h.w);
        point.iter().all(|v| v.is_finite()).then_some(point)
    }

    /// Reprojects every valid pixel of `map`, row-major.
    pub fn reproject_disparity_map(&self, map: &DisparityMap) -> Vec<Option<Vector3<f64>>> {
        let width = map.width as usize;
        (0..map.width as usize * map.height as usize)
            .into_par_iter()
            .map(|index| {
                let (x, y) = ((index % width) as u32, (index / width) as u32);
                map.get(x, y)
                    .and_then(|d| self.reproject(x as f64, y as f64, d as f64))
            })
            .collect()
    }

    /// Undistort-rectify tables for the left and right cameras.
    pub fn remap_tables(
        &self,
        left: &RadTanModel,
        right: &RadTanModel,
    ) -> Result<(RemapTable, RemapTable)> {
        let (left_table, right_table) = rayon::join(
            || build_remap(left, &self.r1, &self.p1, self.image_size),
            || build_remap(right, &self.r2, &self.p2, self.image_size),
        );
        Ok((left_table?, right_table?))
    }
}

#[rustfmt::skip]
fn projection(fc: f64, cc: &Vector2<f64>) -> Matrix3x4<f64> {
    Matrix3x4::new(
        fc, 0.0, cc.x, 0.0,
        0.0, fc, cc.y, 0.0,
        0.0, 0.0, 1.0, 0.0,
    )
}

/// Principal point that centers the rectified image of the four raw corners.
fn principal_point(
    model: &RadTanModel,
    rotation: &Matrix3<f64>,
    fc: f64,
    size: Resolution,
) -> Result<Vector2<f64>> {
    let (w, h) = ((size.width - 1) as f64, (size.height - 1) as f64);
    let corners = [
        Vector2::new(0.0, 0.0),
        Vector2::new(w, 0.0),
        Vector2::new(0.0, h),
        Vector2::new(w, h),
    ];
    let rectified = undistort_points(model, rotation, &projection(fc, &Vector2::zeros()), &corners);
    let mut sum = Vector2::zeros();
    for point in rectified {
        sum += point.ok_or_else(|| StereoError::DegenerateGeometry {
            reason: "image corner cannot be rectified".to_string(),
            condition_number: f64::INFINITY,
        })?;
    }
    Ok(Vector2::new(w * 0.5, h * 0.5) - sum * 0.25)
}

/// Largest rectangle inside, and bounding box of, the rectified image border.
fn border_bounds(
    model: &RadTanModel,
    rotation: &Matrix3<f64>,
    projection: &Matrix3x4<f64>,
    size: Resolution,
) -> Result<(Bounds, Bounds)> {
    let n = BORDER_SAMPLES;
    let step_x = (size.width - 1) as f64 / (n - 1) as f64;
    let step_y = (size.height - 1) as f64 / (n - 1) as f64;
    let grid: Vec<Vector2<f64>> = (0..n)
        .flat_map(|y| (0..n).map(move |x| Vector2::new(x as f64 * step_x, y as f64 * step_y)))
        .collect();
    let rectified = undistort_points(model, rotation, projection, &grid);

    let mut inner = Bounds {
        x0: f64::MIN,
        y0: f64::MIN,
        x1: f64::MAX,
        y1: f64::MAX,
    };
    let mut outer = Bounds {
        x0: f64::MAX,
        y0: f64::MAX,
        x1: f64::MIN,
        y1: f64::MIN,
    };
    for (index, point) in rectified.iter().enumerate() {
        let Some(p) = point else {
            continue;
        };
        let (x, y) = (index % n, index / n);
        outer.x0 = outer.x0.min(p.x);
        outer.x1 = outer.x1.max(p.x);
        outer.y0 = outer.y0.min(p.y);
        outer.y1 = outer.y1.max(p.y);
        if x == 0 {
            inner.x0 = inner.x0.max(p.x);
        }
        if x == n - 1 {
            inner.x1 = inner.x1.min(p.x);
        }
        if y == 0 {
            inner.y0 = inner.y0.max(p.y);
        }
        if y == n - 1 {
            inner.y1 = inner.y1.min(p.y);
        }
    }

    let valid = |b: &Bounds| b.x1 > b.x0 && b.y1 > b.y0 && b.x0.is_finite() && b.y1.is_finite();
    if !valid(&inner) || !valid(&outer) || inner.x0 == f64::MIN || inner.x1 == f64::MAX {
        return Err(StereoError::DegenerateGeometry {
            reason: "rectified image border is empty".to_string(),
            condition_number: f64::INFINITY,
        });
    }
    Ok((inner, outer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraModel;
    use crate::synthetic::SyntheticRig;
    use approx::assert_relative_eq;

    fn build(alpha: f64) -> (SyntheticRig, RectificationModel) {
        let rig = SyntheticRig::default();
        let model =
            RectificationModel::build(&rig.left, &rig.right, &rig.extrinsics, rig.resolution, alpha)
                .unwrap();
        (rig, model)
    }

    fn scene_points() -> Vec<Vector3<f64>> {
        let mut points = Vec::new();
        for i in 0..5 {
            for j in 0..4 {
                let z = 0.8 + 0.3 * ((i + j) % 3) as f64;
                points.push(Vector3::new(-0.12 + 0.06 * i as f64, -0.08 + 0.05 * j as f64, z));
            }
        }
        points
    }

    #[test]
    fn test_rectifying_rotations_are_proper() {
        let (_, model) = build(0.0);
        for r in [model.r1, model.r2] {
            assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
            assert_relative_eq!(r * r.transpose(), Matrix3::identity(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_projections_share_focal_and_row() {
        let (rig, model) = build(0.0);
        assert_eq!(model.p1[(0, 0)], model.p2[(0, 0)]);
        assert_eq!(model.p1[(1, 1)], model.p2[(1, 1)]);
        assert_eq!(model.p1[(1, 2)], model.p2[(1, 2)]);
        assert_relative_eq!(model.baseline(), rig.extrinsics.baseline(), epsilon = 1e-12);
        assert_relative_eq!(
            model.p2[(0, 3)],
            -model.focal_length() * model.baseline(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_corresponding_points_share_rows_and_depth() {
        let (rig, model) = build(0.0);
        let relative = rig.relative_pose();
        for point in scene_points() {
            let left_raw = rig.left.project(&point).unwrap();
            let right_raw = rig.right.project(&relative.transform_point(&point)).unwrap();
            let l = undistort_points(&rig.left, &model.r1, &model.p1, &[left_raw])[0].unwrap();
            let r = undistort_points(&rig.right, &model.r2, &model.p2, &[right_raw])[0].unwrap();
            assert!((l.y - r.y).abs() < 1e-6, "row offset {}", l.y - r.y);

            let reconstructed = model.reproject(l.x, l.y, l.x - r.x).unwrap();
            let expected = model.r1 * point;
            assert!((reconstructed - expected).norm() < 0.01 * expected.z);
        }
    }

    #[test]
    fn test_remap_tables_align_rows() {
        let (rig, model) = build(0.0);
        let (left_table, _) = model.remap_tables(&rig.left, &rig.right).unwrap();
        let relative = rig.relative_pose();
        let depth = 1.2;
        for (x, y) in [(40u32, 30u32), (160, 120), (280, 200), (100, 210)] {
            let source = left_table.source(x, y).unwrap();
            let ray = rig
                .left
                .pixel_to_normalized(&Vector2::new(source.x as f64, source.y as f64))
                .unwrap();
            let point = Vector3::new(ray.x, ray.y, 1.0) * depth;
            let right_raw = rig.right.project_unbounded(&relative.transform_point(&point)).unwrap();
            let r = undistort_points(&rig.right, &model.r2, &model.p2, &[right_raw])[0].unwrap();
            assert!((r.y - y as f64).abs() < 0.5, "pixel ({}, {}) lands on row {}", x, y, r.y);
        }
    }

    #[test]
    fn test_alpha_trades_crop_for_coverage() {
        let (rig, cropped) = build(0.0);
        let (_, full) = build(1.0);
        assert!(full.focal_length() < cropped.focal_length());

        let (table, _) = cropped.remap_tables(&rig.left, &rig.right).unwrap();
        let (w, h) = (rig.resolution.width as f32, rig.resolution.height as f32);
        let inside = (0..rig.resolution.height)
            .flat_map(|y| (0..rig.resolution.width).map(move |x| (x, y)))
            .filter(|&(x, y)| {
                table
                    .source(x, y)
                    .is_some_and(|s| s.x >= -0.5 && s.y >= -0.5 && s.x <= w - 0.5 && s.y <= h - 0.5)
            })
            .count();
        let total = (rig.resolution.width * rig.resolution.height) as usize;
        assert!(inside as f64 > 0.99 * total as f64);
        assert!(cropped.roi_left.area() >= full.roi_left.area());
    }

    #[test]
    fn test_invalid_disparity_has_no_depth() {
        let (_, model) = build(0.0);
        assert!(model.reproject(100.0, 100.0, 0.0).is_none());
        assert!(model.reproject(100.0, 100.0, -3.0).is_none());
        let z = model.reproject(100.0, 100.0, 18.0).unwrap().z;
        assert_relative_eq!(z, model.focal_length() * model.baseline() / 18.0, epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_inputs() {
        let rig = SyntheticRig::default();
        let mut extrinsics = rig.extrinsics;
        extrinsics.translation = Vector3::zeros();
        assert!(matches!(
            RectificationModel::build(&rig.left, &rig.right, &extrinsics, rig.resolution, 0.0),
            Err(StereoError::DegenerateGeometry { .. })
        ));
        assert!(matches!(
            RectificationModel::build(
                &rig.left,
                &rig.right,
                &rig.extrinsics,
                Resolution::new(640, 480),
                0.0
            ),
            Err(StereoError::SizeMismatch { .. })
        ));

        let empty = Resolution::new(0, 0);
        let left = RadTanModel::from_parts(rig.left.intrinsics, empty, rig.left.distortions);
        let right = RadTanModel::from_parts(rig.right.intrinsics, empty, rig.right.distortions);
        assert!(matches!(
            RectificationModel::build(&left, &right, &rig.extrinsics, empty, 0.0),
            Err(StereoError::InvalidConfig(_))
        ));
    }
}
