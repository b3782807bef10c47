//! Single-camera calibration from planar pattern observations.
//!
//! The camera matrix is initialized in closed form from the plane-to-image
//! homographies of all views (Zhang's method, with a principal-point-at-center
//! fallback for weakly tilted view sets). The camera matrix, the five
//! distortion coefficients and every view pose are then refined jointly by
//! minimizing the total reprojection error.

use crate::camera::{CameraModel, Intrinsics, RadTanModel, Resolution};
use crate::error::{Result, StereoError};
use crate::geometry::{homography_dlt, pose_from_homography, Pose};
use crate::optimization::solver::{self, LeastSquaresProblem, SolverOptions};
use crate::optimization::{compute_reprojection_error, Optimizer, ProjectionError};
use crate::pattern::{CalibrationPattern, CornerObservation};
use log::{info, warn};
use nalgebra::{DMatrix, DVector, Matrix3, SVector, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Residual used when a pattern point falls behind the camera.
pub(crate) const BEHIND_CAMERA_RESIDUAL: f64 = 1e6;

/// Relative singular-value gap below which Zhang's system is rank deficient.
const ZHANG_RANK_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicOptions {
    /// Fewer valid observations than this fail with `InsufficientObservations`.
    pub min_observations: usize,
    pub solver: SolverOptions,
}

impl Default for IntrinsicOptions {
    fn default() -> Self {
        IntrinsicOptions {
            min_observations: 3,
            solver: SolverOptions::default(),
        }
    }
}

/// Result of a single-camera calibration.
#[derive(Debug, Clone)]
pub struct IntrinsicCalibration {
    pub model: RadTanModel,
    /// Pattern-to-camera pose of every used observation.
    pub poses: Vec<Pose>,
    /// Root-mean-square reprojection error in pixels.
    pub rms: f64,
    pub errors: ProjectionError,
    pub iterations: usize,
}

/// Calibrates one camera.
///
/// # Errors
///
/// * [`StereoError::InsufficientObservations`] when fewer than
///   `options.min_observations` complete observations are supplied.
/// * [`StereoError::DegenerateGeometry`] when the views do not constrain the
///   camera (for example all pattern planes parallel to the sensor).
/// * [`StereoError::ConvergenceFailure`] when the refinement hits its iteration cap.
pub fn calibrate_intrinsics(
    pattern: &CalibrationPattern,
    observations: &[CornerObservation],
    image_size: Resolution,
    options: &IntrinsicOptions,
) -> Result<IntrinsicCalibration> {
    let mut calibrator = IntrinsicCalibrator::new(pattern, observations, image_size, *options)?;
    calibrator.linear_estimation()?;
    calibrator.optimize(true)?;
    calibrator.into_calibration()
}

pub struct IntrinsicCalibrator {
    object_points: Vec<Vector3<f64>>,
    plane_points: Vec<Vector2<f64>>,
    views: Vec<Vec<Vector2<f64>>>,
    options: IntrinsicOptions,
    model: RadTanModel,
    poses: Vec<Pose>,
    initialized: bool,
    rms: Option<f64>,
    iterations: usize,
}

impl IntrinsicCalibrator {
    pub fn new(
        pattern: &CalibrationPattern,
        observations: &[CornerObservation],
        image_size: Resolution,
        options: IntrinsicOptions,
    ) -> Result<Self> {
        pattern.validate()?;
        let views: Vec<Vec<Vector2<f64>>> = observations
            .iter()
            .filter(|obs| {
                let complete = obs.matches(pattern);
                if !complete {
                    warn!(
                        "ignoring observation with {} points, pattern has {}",
                        obs.len(),
                        pattern.point_count()
                    );
                }
                complete
            })
            .map(|obs| obs.points.clone())
            .collect();

        let required = options.min_observations.max(1);
        if views.len() < required {
            return Err(StereoError::InsufficientObservations {
                found: views.len(),
                required,
            });
        }

        let fallback = Intrinsics {
            fx: image_size.width.max(image_size.height) as f64,
            fy: image_size.width.max(image_size.height) as f64,
            cx: image_size.width as f64 / 2.0,
            cy: image_size.height as f64 / 2.0,
        };

        Ok(IntrinsicCalibrator {
            object_points: pattern.object_points(),
            plane_points: pattern.plane_points(),
            views,
            options,
            model: RadTanModel::pinhole(fallback, image_size),
            poses: Vec::new(),
            initialized: false,
            rms: None,
            iterations: 0,
        })
    }

    pub fn model(&self) -> &RadTanModel {
        &self.model
    }

    pub fn poses(&self) -> &[Pose] {
        &self.poses
    }

    pub fn into_calibration(self) -> Result<IntrinsicCalibration> {
        let errors = self.reprojection_error()?;
        Ok(IntrinsicCalibration {
            rms: self.rms.unwrap_or(errors.rmse),
            model: self.model,
            poses: self.poses,
            errors,
            iterations: self.iterations,
        })
    }

    fn homographies(&self) -> Result<Vec<Matrix3<f64>>> {
        self.views
            .iter()
            .map(|view| {
                homography_dlt(&self.plane_points, view).ok_or_else(|| {
                    StereoError::DegenerateGeometry {
                        reason: "pattern homography could not be estimated".to_string(),
                        condition_number: f64::INFINITY,
                    }
                })
            })
            .collect()
    }
}

/// Similarity that centers the image and scales it to roughly unit extent.
fn image_normalization(size: &Resolution) -> Matrix3<f64> {
    let s = size.width.max(size.height).max(1) as f64 / 2.0;
    let (cx, cy) = (size.width as f64 / 2.0, size.height as f64 / 2.0);
    Matrix3::new(1.0 / s, 0.0, -cx / s, 0.0, 1.0 / s, -cy / s, 0.0, 0.0, 1.0)
}

fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> SVector<f64, 6> {
    let hi = h.column(i);
    let hj = h.column(j);
    SVector::<f64, 6>::from_row_slice(&[
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ])
}

/// Zhang's closed-form camera matrix (zero skew) from normalized homographies.
fn zhang_camera_matrix(homographies: &[Matrix3<f64>]) -> Option<Matrix3<f64>> {
    let m = homographies.len();
    let mut v = DMatrix::<f64>::zeros((2 * m).max(6), 6);
    for (k, h) in homographies.iter().enumerate() {
        let h = h / h.norm();
        v.row_mut(2 * k).copy_from(&v_ij(&h, 0, 1).transpose());
        v.row_mut(2 * k + 1)
            .copy_from(&(v_ij(&h, 0, 0) - v_ij(&h, 1, 1)).transpose());
    }

    let svd = v.svd(false, true);
    let v_t = svd.v_t?;
    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
    let largest = svd.singular_values[order[0]];
    let second_smallest = svd.singular_values[order[order.len() - 2]];
    if !(second_smallest > ZHANG_RANK_TOLERANCE * largest) {
        return None;
    }

    let b = v_t.row(order[order.len() - 1]);
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() <= f64::EPSILON * (b11 * b11 + b22 * b22) {
        return None;
    }
    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    let alpha_sq = lambda / b11;
    let beta_sq = lambda * b11 / denom;
    if !(alpha_sq > 0.0 && beta_sq > 0.0) {
        return None;
    }
    let alpha = alpha_sq.sqrt();
    let beta = beta_sq.sqrt();
    let gamma = -b12 * alpha_sq * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha_sq / lambda;

    Some(Matrix3::new(alpha, 0.0, u0, 0.0, beta, v0, 0.0, 0.0, 1.0))
}

/// Focal lengths with the principal point fixed at the normalized origin,
/// solved from the orthogonality of the pattern axes and diagonals.
fn centered_camera_matrix(homographies: &[Matrix3<f64>]) -> std::result::Result<Matrix3<f64>, f64> {
    let m = homographies.len();
    let mut a = DMatrix::<f64>::zeros(2 * m, 2);
    let mut b = DVector::<f64>::zeros(2 * m);
    for (k, h) in homographies.iter().enumerate() {
        let c0 = h.column(0).normalize();
        let c1 = h.column(1).normalize();
        let d1 = ((h.column(0) + h.column(1)) * 0.5).normalize();
        let d2 = ((h.column(0) - h.column(1)) * 0.5).normalize();
        a[(2 * k, 0)] = c0[0] * c1[0];
        a[(2 * k, 1)] = c0[1] * c1[1];
        b[2 * k] = -c0[2] * c1[2];
        a[(2 * k + 1, 0)] = d1[0] * d2[0];
        a[(2 * k + 1, 1)] = d1[1] * d2[1];
        b[2 * k + 1] = -d1[2] * d2[2];
    }

    let condition = crate::geometry::condition_number(&a);
    let svd = a.svd(true, true);
    let f = svd.solve(&b, 1e-12).map_err(|_| condition)?;
    let fx = (1.0 / f[0]).abs().sqrt();
    let fy = (1.0 / f[1]).abs().sqrt();
    // normalized focal lengths beyond 100 correspond to a field of view below 1 degree
    if !(fx.is_finite() && fy.is_finite() && fx < 100.0 && fy < 100.0 && condition < 1e8) {
        return Err(condition);
    }
    Ok(Matrix3::new(fx, 0.0, 0.0, 0.0, fy, 0.0, 0.0, 0.0, 1.0))
}

fn plausible_camera_matrix(k: &Matrix3<f64>) -> bool {
    // normalized image spans [-1, 1]; allow the principal point well outside it
    let (fx, fy, cx, cy) = (k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]);
    fx.is_finite()
        && fy.is_finite()
        && fx > 0.05
        && fy > 0.05
        && fx < 100.0
        && fy < 100.0
        && cx.abs() < 2.0
        && cy.abs() < 2.0
}

impl Optimizer for IntrinsicCalibrator {
    fn linear_estimation(&mut self) -> Result<()> {
        let resolution = self.model.resolution;
        let n = image_normalization(&resolution);
        let n_inv = n.try_inverse().ok_or_else(|| StereoError::InvalidConfig(
            "image size must be non-zero".to_string(),
        ))?;

        let homographies = self.homographies()?;
        let normalized: Vec<Matrix3<f64>> = homographies.iter().map(|h| n * h).collect();

        let k_normalized = match zhang_camera_matrix(&normalized) {
            Some(k) if plausible_camera_matrix(&k) => k,
            _ => {
                info!("closed-form camera matrix unusable, assuming a centered principal point");
                centered_camera_matrix(&normalized).map_err(|condition_number| {
                    StereoError::DegenerateGeometry {
                        reason: "pattern views do not constrain the focal length".to_string(),
                        condition_number,
                    }
                })?
            }
        };
        let k = n_inv * k_normalized;
        let intrinsics = Intrinsics::from_matrix(&(k / k[(2, 2)]));

        let poses = homographies
            .iter()
            .map(|h| {
                pose_from_homography(&intrinsics.to_matrix(), h).ok_or_else(|| {
                    StereoError::DegenerateGeometry {
                        reason: "view pose could not be recovered from its homography".to_string(),
                        condition_number: f64::INFINITY,
                    }
                })
            })
            .collect::<Result<Vec<Pose>>>()?;

        self.model = RadTanModel::pinhole(intrinsics, resolution);
        self.model.validate_params()?;
        self.poses = poses;
        self.initialized = true;
        Ok(())
    }

    fn optimize(&mut self, verbose: bool) -> Result<()> {
        if !self.initialized {
            self.linear_estimation()?;
        }

        let problem = PlanarCalibrationProblem {
            model: self.model.clone(),
            object_points: &self.object_points,
            views: &self.views,
        };
        let mut initial = Vec::with_capacity(9 + 6 * self.poses.len());
        initial.extend_from_slice(&self.model.params());
        for pose in &self.poses {
            initial.extend(pose_params(pose));
        }

        let report = solver::solve(&problem, DVector::from_vec(initial), &self.options.solver)?;
        let residual_count = 2 * self.object_points.len() * self.views.len();

        self.model = self.model.with_params(&report.params.as_slice()[..9]);
        self.model.validate_params()?;
        self.poses = (0..self.views.len())
            .map(|i| pose_from_params(&report.params, 9 + 6 * i))
            .collect();
        self.iterations = report.iterations;
        let rms = report.rms(residual_count);
        self.rms = Some(rms);

        if verbose {
            info!(
                "intrinsic calibration: {} views, {} iterations ({:?}), rms {:.6} px",
                self.views.len(),
                report.iterations,
                report.termination,
                rms
            );
            info!("{:?}", self.model);
        }
        Ok(())
    }

    fn reprojection_error(&self) -> Result<ProjectionError> {
        compute_reprojection_error(&self.model, &self.poses, &self.object_points, &self.views)
    }
}

pub(crate) fn pose_params(pose: &Pose) -> [f64; 6] {
    let r = pose.rvec();
    let t = pose.translation;
    [r.x, r.y, r.z, t.x, t.y, t.z]
}

pub(crate) fn pose_from_params(params: &DVector<f64>, offset: usize) -> Pose {
    Pose::from_rvec(
        &Vector3::new(params[offset], params[offset + 1], params[offset + 2]),
        Vector3::new(params[offset + 3], params[offset + 4], params[offset + 5]),
    )
}

/// Re-projects the rotation block at `offset` onto SO(3) and writes it back.
pub(crate) fn retract_rotation(params: &mut DVector<f64>, offset: usize) {
    let pose = pose_from_params(params, offset);
    let rvec = pose.rvec();
    params[offset] = rvec.x;
    params[offset + 1] = rvec.y;
    params[offset + 2] = rvec.z;
}

pub(crate) fn push_reprojection(
    model: &RadTanModel,
    point_cam: &Vector3<f64>,
    observed: &Vector2<f64>,
    residuals: &mut Vec<f64>,
) {
    match model.project_unbounded(point_cam) {
        Ok(p) => {
            residuals.push(p.x - observed.x);
            residuals.push(p.y - observed.y);
        }
        Err(_) => {
            residuals.push(BEHIND_CAMERA_RESIDUAL);
            residuals.push(BEHIND_CAMERA_RESIDUAL);
        }
    }
}

/// Parameters: `[fx, fy, cx, cy, k1, k2, p1, p2, k3]` followed by
/// `[rvec, t]` of every view.
struct PlanarCalibrationProblem<'a> {
    model: RadTanModel,
    object_points: &'a [Vector3<f64>],
    views: &'a [Vec<Vector2<f64>>],
}

impl LeastSquaresProblem for PlanarCalibrationProblem<'_> {
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let model = self.model.with_params(&params.as_slice()[..9]);
        let mut residuals = Vec::with_capacity(2 * self.object_points.len() * self.views.len());
        for (i, view) in self.views.iter().enumerate() {
            let pose = pose_from_params(params, 9 + 6 * i);
            for (point, observed) in self.object_points.iter().zip(view) {
                push_reprojection(&model, &pose.transform_point(point), observed, &mut residuals);
            }
        }
        DVector::from_vec(residuals)
    }

    fn retract(&self, params: &mut DVector<f64>) {
        for i in 0..self.views.len() {
            retract_rotation(params, 9 + 6 * i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{self, SyntheticRig};
    use approx::assert_relative_eq;

    #[test]
    fn test_zhang_recovers_camera_matrix() {
        let rig = SyntheticRig::default();
        let pattern = CalibrationPattern::default();
        let views = synthetic::observe_views(&rig.left, &pattern, &rig.left_board_poses(), 0.0, 1);

        let mut calibrator =
            IntrinsicCalibrator::new(&pattern, &views, rig.resolution, IntrinsicOptions::default())
                .unwrap();
        calibrator.linear_estimation().unwrap();
        // the synthetic left camera has distortion, the closed form ignores it
        let k = calibrator.model().intrinsics;
        assert_relative_eq!(k.fx, rig.left.intrinsics.fx, max_relative = 0.1);
        assert_relative_eq!(k.fy, rig.left.intrinsics.fy, max_relative = 0.1);
    }

    #[test]
    fn test_noise_free_calibration_is_exact() {
        let rig = SyntheticRig::default();
        let pattern = CalibrationPattern::default();
        let truth = RadTanModel::pinhole(rig.left.intrinsics, rig.resolution);
        let poses = rig.left_board_poses();
        let views = synthetic::observe_views(&truth, &pattern, &poses, 0.0, 1);

        let result =
            calibrate_intrinsics(&pattern, &views, rig.resolution, &IntrinsicOptions::default())
                .unwrap();

        assert!(result.rms < 1e-6, "rms {}", result.rms);
        assert_relative_eq!(result.model.intrinsics.fx, truth.intrinsics.fx, epsilon = 1e-4);
        assert_relative_eq!(result.model.intrinsics.fy, truth.intrinsics.fy, epsilon = 1e-4);
        assert_relative_eq!(result.model.intrinsics.cx, truth.intrinsics.cx, epsilon = 1e-4);
        assert_relative_eq!(result.model.intrinsics.cy, truth.intrinsics.cy, epsilon = 1e-4);
        for k in result.model.distortions {
            assert!(k.abs() < 1e-6);
        }
        for (estimated, expected) in result.poses.iter().zip(&poses) {
            assert_relative_eq!(estimated.translation, expected.translation, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_calibration_with_distortion_and_noise() {
        let rig = SyntheticRig::default();
        let pattern = CalibrationPattern::default();
        let views = synthetic::observe_views(&rig.left, &pattern, &rig.left_board_poses(), 0.1, 7);

        let result =
            calibrate_intrinsics(&pattern, &views, rig.resolution, &IntrinsicOptions::default())
                .unwrap();
        assert!(result.rms < 0.2, "rms {}", result.rms);
        assert_relative_eq!(result.model.intrinsics.fx, rig.left.intrinsics.fx, max_relative = 0.01);
        assert_relative_eq!(result.model.distortions[0], rig.left.distortions[0], epsilon = 0.02);
        assert_relative_eq!(result.errors.rmse, result.rms, epsilon = 1e-9);
    }

    #[test]
    fn test_two_views_are_insufficient() {
        let rig = SyntheticRig::default();
        let pattern = CalibrationPattern::default();
        let views = synthetic::observe_views(&rig.left, &pattern, &rig.left_board_poses()[..2], 0.0, 1);

        let result =
            calibrate_intrinsics(&pattern, &views, rig.resolution, &IntrinsicOptions::default());
        assert!(matches!(
            result,
            Err(StereoError::InsufficientObservations {
                found: 2,
                required: 3
            })
        ));
    }

    #[test]
    fn test_fronto_parallel_views_are_degenerate() {
        let rig = SyntheticRig::default();
        let pattern = CalibrationPattern::default();
        let truth = RadTanModel::pinhole(rig.left.intrinsics, rig.resolution);
        let poses: Vec<Pose> = (0..5)
            .map(|i| {
                let angle = 0.1 * i as f64;
                Pose::from_rvec(
                    &Vector3::new(0.0, 0.0, angle),
                    Vector3::new(-0.16 + 0.01 * i as f64, -0.1, 0.7 + 0.05 * i as f64),
                )
            })
            .collect();
        let views = synthetic::observe_views(&truth, &pattern, &poses, 0.0, 1);

        let result =
            calibrate_intrinsics(&pattern, &views, rig.resolution, &IntrinsicOptions::default());
        assert!(
            matches!(result, Err(StereoError::DegenerateGeometry { .. })),
            "{:?}",
            result.map(|r| r.rms)
        );
    }
}
