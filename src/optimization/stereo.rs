//! Relative pose between the two cameras of the rig.
//!
//! Each stereo pair yields one estimate of the left-to-right transform from
//! the two independently recovered pattern poses. The estimates are averaged
//! (rotations through their SVD projection) and then refined together with
//! the left-camera view poses, and optionally both camera models, by
//! minimizing the joint reprojection error of both cameras.

use crate::camera::{CameraModel, RadTanModel, Resolution};
use crate::error::{Result, StereoError};
use crate::geometry::{
    essential_matrix, fundamental_matrix, homography_dlt, pose_from_homography, project_to_so3,
    Pose,
};
use crate::optimization::intrinsic::{pose_from_params, pose_params, push_reprojection, retract_rotation};
use crate::optimization::solver::{self, LeastSquaresProblem, SolverOptions};
use crate::optimization::{compute_reprojection_error, Optimizer, ProjectionError};
use crate::pattern::{CalibrationPattern, StereoObservationPair};
use log::info;
use nalgebra::{DVector, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StereoOptions {
    pub min_observations: usize,
    /// Hold both camera models constant and refine only poses.
    pub fix_intrinsics: bool,
    pub solver: SolverOptions,
}

impl Default for StereoOptions {
    fn default() -> Self {
        StereoOptions {
            min_observations: 3,
            fix_intrinsics: true,
            solver: SolverOptions::default(),
        }
    }
}

/// Left-to-right rigid transform `x_right = rotation * x_left + translation`
/// with its epipolar matrices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StereoExtrinsics {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub essential: Matrix3<f64>,
    pub fundamental: Matrix3<f64>,
}

impl StereoExtrinsics {
    /// Derives E and F for a relative pose between two calibrated cameras.
    pub fn from_pose(
        rotation: Matrix3<f64>,
        translation: Vector3<f64>,
        left: &RadTanModel,
        right: &RadTanModel,
    ) -> Result<Self> {
        let rotation = project_to_so3(&rotation);
        let essential = essential_matrix(&rotation, &translation);
        let fundamental = fundamental_matrix(&left.camera_matrix(), &right.camera_matrix(), &essential)
            .ok_or_else(|| StereoError::DegenerateGeometry {
                reason: "camera matrix is singular".to_string(),
                condition_number: f64::INFINITY,
            })?;
        Ok(StereoExtrinsics {
            rotation,
            translation,
            essential,
            fundamental,
        })
    }

    pub fn baseline(&self) -> f64 {
        self.translation.norm()
    }
}

#[derive(Debug, Clone)]
pub struct StereoCalibration {
    pub extrinsics: StereoExtrinsics,
    /// Camera models after the solve; unchanged when intrinsics are fixed.
    pub left: RadTanModel,
    pub right: RadTanModel,
    /// Pattern-to-left-camera pose of every pair.
    pub poses: Vec<Pose>,
    /// Root-mean-square reprojection error over both cameras, in pixels.
    pub rms: f64,
    pub left_errors: ProjectionError,
    pub right_errors: ProjectionError,
    pub iterations: usize,
}

/// Calibrates the relative pose of the rig.
///
/// # Errors
///
/// Same failure kinds as [`crate::optimization::calibrate_intrinsics`].
pub fn calibrate_stereo(
    pattern: &CalibrationPattern,
    pairs: &[StereoObservationPair],
    left: &RadTanModel,
    right: &RadTanModel,
    image_size: Resolution,
    options: &StereoOptions,
) -> Result<StereoCalibration> {
    let mut calibrator = StereoCalibrator::new(pattern, pairs, left, right, image_size, *options)?;
    calibrator.linear_estimation()?;
    calibrator.optimize(true)?;
    calibrator.into_calibration()
}

pub struct StereoCalibrator {
    object_points: Vec<Vector3<f64>>,
    plane_points: Vec<Vector2<f64>>,
    left_views: Vec<Vec<Vector2<f64>>>,
    right_views: Vec<Vec<Vector2<f64>>>,
    options: StereoOptions,
    left: RadTanModel,
    right: RadTanModel,
    relative: Pose,
    poses: Vec<Pose>,
    initialized: bool,
    rms: Option<f64>,
    iterations: usize,
}

impl StereoCalibrator {
    pub fn new(
        pattern: &CalibrationPattern,
        pairs: &[StereoObservationPair],
        left: &RadTanModel,
        right: &RadTanModel,
        image_size: Resolution,
        options: StereoOptions,
    ) -> Result<Self> {
        pattern.validate()?;
        left.validate_params()?;
        right.validate_params()?;
        for model in [left, right] {
            if model.resolution != image_size {
                return Err(StereoError::SizeMismatch {
                    expected: (model.resolution.width, model.resolution.height),
                    actual: (image_size.width, image_size.height),
                });
            }
        }

        let (left_views, right_views): (Vec<_>, Vec<_>) = pairs
            .iter()
            .filter(|pair| pair.left.matches(pattern) && pair.right.matches(pattern))
            .map(|pair| (pair.left.points.clone(), pair.right.points.clone()))
            .unzip();

        let required = options.min_observations.max(1);
        if left_views.len() < required {
            return Err(StereoError::InsufficientObservations {
                found: left_views.len(),
                required,
            });
        }

        Ok(StereoCalibrator {
            object_points: pattern.object_points(),
            plane_points: pattern.plane_points(),
            left_views,
            right_views,
            options,
            left: left.clone(),
            right: right.clone(),
            relative: Pose::identity(),
            poses: Vec::new(),
            initialized: false,
            rms: None,
            iterations: 0,
        })
    }

    pub fn into_calibration(self) -> Result<StereoCalibration> {
        let left_errors =
            compute_reprojection_error(&self.left, &self.poses, &self.object_points, &self.left_views)?;
        let right_poses: Vec<Pose> = self.poses.iter().map(|p| self.relative.compose(p)).collect();
        let right_errors =
            compute_reprojection_error(&self.right, &right_poses, &self.object_points, &self.right_views)?;
        let extrinsics = StereoExtrinsics::from_pose(
            self.relative.rotation,
            self.relative.translation,
            &self.left,
            &self.right,
        )?;
        let rms = self.rms.unwrap_or_else(|| {
            (0.5 * (left_errors.rmse.powi(2) + right_errors.rmse.powi(2))).sqrt()
        });

        Ok(StereoCalibration {
            extrinsics,
            left: self.left,
            right: self.right,
            poses: self.poses,
            rms,
            left_errors,
            right_errors,
            iterations: self.iterations,
        })
    }

    /// Pose of the pattern in one camera from its undistorted observations.
    fn view_pose(&self, model: &RadTanModel, view: &[Vector2<f64>]) -> Result<Pose> {
        let normalized = view
            .iter()
            .map(|p| model.pixel_to_normalized(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        homography_dlt(&self.plane_points, &normalized)
            .and_then(|h| pose_from_homography(&Matrix3::identity(), &h))
            .ok_or_else(|| StereoError::DegenerateGeometry {
                reason: "view pose could not be recovered from its homography".to_string(),
                condition_number: f64::INFINITY,
            })
    }

    fn packed_params(&self) -> Vec<f64> {
        let mut params = Vec::with_capacity(6 + 6 * self.poses.len() + 18);
        params.extend(pose_params(&self.relative));
        for pose in &self.poses {
            params.extend(pose_params(pose));
        }
        if !self.options.fix_intrinsics {
            params.extend_from_slice(&self.left.params());
            params.extend_from_slice(&self.right.params());
        }
        params
    }
}

impl Optimizer for StereoCalibrator {
    fn linear_estimation(&mut self) -> Result<()> {
        let mut rotation_sum = Matrix3::zeros();
        let mut translation_sum = Vector3::zeros();
        let mut left_poses = Vec::with_capacity(self.left_views.len());

        for (left_view, right_view) in self.left_views.iter().zip(&self.right_views) {
            let left_pose = self.view_pose(&self.left, left_view)?;
            let right_pose = self.view_pose(&self.right, right_view)?;
            let relative = right_pose.compose(&left_pose.inverse());
            rotation_sum += relative.rotation;
            translation_sum += relative.translation;
            left_poses.push(left_pose);
        }

        let count = left_poses.len() as f64;
        self.relative = Pose::new(project_to_so3(&rotation_sum), translation_sum / count);
        self.poses = left_poses;
        self.initialized = true;

        info!(
            "initial stereo baseline {:.4} m from {} pairs",
            self.relative.translation.norm(),
            self.poses.len()
        );
        Ok(())
    }

    fn optimize(&mut self, verbose: bool) -> Result<()> {
        if !self.initialized {
            self.linear_estimation()?;
        }

        let problem = StereoProblem {
            left: self.left.clone(),
            right: self.right.clone(),
            object_points: &self.object_points,
            left_views: &self.left_views,
            right_views: &self.right_views,
            fix_intrinsics: self.options.fix_intrinsics,
        };
        let report = solver::solve(
            &problem,
            DVector::from_vec(self.packed_params()),
            &self.options.solver,
        )?;
        let residual_count = 4 * self.object_points.len() * self.left_views.len();

        let views = self.left_views.len();
        self.relative = pose_from_params(&report.params, 0);
        self.poses = (0..views)
            .map(|i| pose_from_params(&report.params, 6 + 6 * i))
            .collect();
        if !self.options.fix_intrinsics {
            let offset = 6 + 6 * views;
            self.left = self.left.with_params(&report.params.as_slice()[offset..offset + 9]);
            self.right = self
                .right
                .with_params(&report.params.as_slice()[offset + 9..offset + 18]);
            self.left.validate_params()?;
            self.right.validate_params()?;
        }
        self.iterations = report.iterations;
        let rms = report.rms(residual_count);
        self.rms = Some(rms);

        if verbose {
            info!(
                "stereo calibration: {} pairs, {} iterations ({:?}), rms {:.6} px, baseline {:.4} m",
                views,
                report.iterations,
                report.termination,
                rms,
                self.relative.translation.norm()
            );
        }
        Ok(())
    }

    fn reprojection_error(&self) -> Result<ProjectionError> {
        let right_poses: Vec<Pose> = self.poses.iter().map(|p| self.relative.compose(p)).collect();
        let mut distances = Vec::new();
        for (model, poses, views) in [
            (&self.left, &self.poses, &self.left_views),
            (&self.right, &right_poses, &self.right_views),
        ] {
            for (pose, view) in poses.iter().zip(views.iter()) {
                for (point, pixel) in self.object_points.iter().zip(view) {
                    let projected = model.project_unbounded(&pose.transform_point(point))?;
                    distances.push((projected - pixel).norm());
                }
            }
        }
        ProjectionError::from_distances(&distances).ok_or(StereoError::InsufficientObservations {
            found: 0,
            required: 1,
        })
    }
}

/// Parameters: relative `[rvec, t]`, left-camera `[rvec, t]` of every view,
/// then both camera models when intrinsics are free.
struct StereoProblem<'a> {
    left: RadTanModel,
    right: RadTanModel,
    object_points: &'a [Vector3<f64>],
    left_views: &'a [Vec<Vector2<f64>>],
    right_views: &'a [Vec<Vector2<f64>>],
    fix_intrinsics: bool,
}

impl LeastSquaresProblem for StereoProblem<'_> {
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let views = self.left_views.len();
        let (left, right) = if self.fix_intrinsics {
            (self.left.clone(), self.right.clone())
        } else {
            let offset = 6 + 6 * views;
            (
                self.left.with_params(&params.as_slice()[offset..offset + 9]),
                self.right.with_params(&params.as_slice()[offset + 9..offset + 18]),
            )
        };
        let relative = pose_from_params(params, 0);

        let mut residuals = Vec::with_capacity(4 * self.object_points.len() * views);
        for (i, (left_view, right_view)) in self.left_views.iter().zip(self.right_views).enumerate() {
            let pose = pose_from_params(params, 6 + 6 * i);
            for ((point, left_obs), right_obs) in
                self.object_points.iter().zip(left_view).zip(right_view)
            {
                let in_left = pose.transform_point(point);
                push_reprojection(&left, &in_left, left_obs, &mut residuals);
                push_reprojection(&right, &relative.transform_point(&in_left), right_obs, &mut residuals);
            }
        }
        DVector::from_vec(residuals)
    }

    fn retract(&self, params: &mut DVector<f64>) {
        retract_rotation(params, 0);
        for i in 0..self.left_views.len() {
            retract_rotation(params, 6 + 6 * i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::{calibrate_intrinsics, IntrinsicOptions};
    use crate::synthetic::{self, SyntheticRig};
    use approx::assert_relative_eq;

    #[test]
    fn test_noise_free_stereo_is_exact() {
        let rig = SyntheticRig::default();
        let pattern = CalibrationPattern::default();
        let pairs = synthetic::observe_pairs(&rig, &pattern, 0.0, 3);

        let result = calibrate_stereo(
            &pattern,
            &pairs,
            &rig.left,
            &rig.right,
            rig.resolution,
            &StereoOptions::default(),
        )
        .unwrap();

        assert!(result.rms < 1e-6, "rms {}", result.rms);
        assert_relative_eq!(result.extrinsics.rotation, rig.extrinsics.rotation, epsilon = 1e-9);
        assert_relative_eq!(result.extrinsics.translation, rig.extrinsics.translation, epsilon = 1e-9);
        let r = result.extrinsics.rotation;
        assert_relative_eq!(r * r.transpose(), Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_essential_and_fundamental_are_consistent() {
        let rig = SyntheticRig::default();
        let pattern = CalibrationPattern::default();
        let pairs = synthetic::observe_pairs(&rig, &pattern, 0.0, 3);
        let result = calibrate_stereo(
            &pattern,
            &pairs,
            &rig.left,
            &rig.right,
            rig.resolution,
            &StereoOptions::default(),
        )
        .unwrap();

        let e = result.extrinsics.essential;
        let t = result.extrinsics.translation;
        assert_relative_eq!(e, crate::geometry::skew(&t) * result.extrinsics.rotation, epsilon = 1e-12);

        // undistorted correspondences satisfy x_r^T F x_l = 0
        let f = result.extrinsics.fundamental;
        let pose = rig.left_board_poses()[0];
        for point in pattern.object_points().iter().step_by(7) {
            let in_left = pose.transform_point(point);
            let in_right = rig.extrinsics.rotation * in_left + rig.extrinsics.translation;
            let ul = rig.left.camera_matrix() * (in_left / in_left.z);
            let ur = rig.right.camera_matrix() * (in_right / in_right.z);
            let value = (ur.transpose() * f * ul)[(0, 0)];
            assert!(value.abs() < 1e-6 * f.norm() * ul.norm() * ur.norm());
        }
    }

    #[test]
    fn test_joint_refinement_with_free_intrinsics() {
        let rig = SyntheticRig::default();
        let pattern = CalibrationPattern::default();
        let pairs = synthetic::observe_pairs(&rig, &pattern, 0.05, 11);
        let lefts: Vec<_> = pairs.iter().map(|p| p.left.clone()).collect();
        let rights: Vec<_> = pairs.iter().map(|p| p.right.clone()).collect();
        let options = IntrinsicOptions::default();
        let left = calibrate_intrinsics(&pattern, &lefts, rig.resolution, &options).unwrap();
        let right = calibrate_intrinsics(&pattern, &rights, rig.resolution, &options).unwrap();

        let stereo_options = StereoOptions {
            fix_intrinsics: false,
            ..StereoOptions::default()
        };
        let result = calibrate_stereo(
            &pattern,
            &pairs,
            &left.model,
            &right.model,
            rig.resolution,
            &stereo_options,
        )
        .unwrap();
        assert!(result.rms < 0.1, "rms {}", result.rms);
        assert_relative_eq!(result.extrinsics.baseline(), rig.extrinsics.baseline(), max_relative = 0.01);
    }

    #[test]
    fn test_two_pairs_are_insufficient() {
        let rig = SyntheticRig::default();
        let pattern = CalibrationPattern::default();
        let pairs = synthetic::observe_pairs(&rig, &pattern, 0.0, 3);
        let result = calibrate_stereo(
            &pattern,
            &pairs[..2],
            &rig.left,
            &rig.right,
            rig.resolution,
            &StereoOptions::default(),
        );
        assert!(matches!(
            result,
            Err(StereoError::InsufficientObservations { found: 2, .. })
        ));
    }
}
