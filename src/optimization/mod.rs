//! The `optimization` module calibrates the cameras of the stereo rig.
//!
//! Calibration runs in two stages, each implementing the [`Optimizer`] trait:
//!
//! 1. [`IntrinsicCalibrator`] estimates one camera's matrix and distortion
//!    from planar pattern observations (closed-form initialization followed by
//!    nonlinear refinement of all parameters and per-view poses).
//! 2. [`StereoCalibrator`] estimates the rigid transform between the two
//!    cameras from jointly observed pattern views.
//!
//! Both stages share the damped least-squares routine in [`solver`].

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod intrinsic;
pub mod solver;
pub mod stereo;

pub use intrinsic::{calibrate_intrinsics, IntrinsicCalibration, IntrinsicCalibrator, IntrinsicOptions};
pub use solver::{LeastSquaresProblem, SolverOptions, SolverReport, Termination};
pub use stereo::{calibrate_stereo, StereoCalibration, StereoCalibrator, StereoExtrinsics, StereoOptions};

use crate::camera::RadTanModel;
use crate::error::{Result, StereoError};
use crate::geometry::Pose;
use nalgebra::{Vector2, Vector3};

/// Summary statistics of per-point reprojection distances, in pixels.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

impl ProjectionError {
    /// Statistics over a set of reprojection distances.
    pub fn from_distances(distances: &[f64]) -> Option<Self> {
        if distances.is_empty() {
            return None;
        }
        let n = distances.len() as f64;
        let mean = distances.iter().sum::<f64>() / n;
        let variance = distances.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let rmse = (distances.iter().map(|x| x * x).sum::<f64>() / n).sqrt();

        let mut sorted = distances.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(ProjectionError {
            rmse,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }
}

/// Reprojection error of pattern points seen from known per-view poses.
///
/// # Errors
///
/// [`StereoError::Camera`] if a pattern point ends up behind the camera and
/// [`StereoError::InsufficientObservations`] when there is nothing to measure.
pub fn compute_reprojection_error(
    model: &RadTanModel,
    poses: &[Pose],
    object_points: &[Vector3<f64>],
    views: &[Vec<Vector2<f64>>],
) -> Result<ProjectionError> {
    let mut distances = Vec::with_capacity(object_points.len() * views.len());
    for (pose, observed) in poses.iter().zip(views) {
        for (point, pixel) in object_points.iter().zip(observed) {
            let projected = model.project_unbounded(&pose.transform_point(point))?;
            distances.push((projected - pixel).norm());
        }
    }
    ProjectionError::from_distances(&distances).ok_or(StereoError::InsufficientObservations {
        found: 0,
        required: 1,
    })
}

/// A calibration stage: closed-form initialization followed by refinement.
pub trait Optimizer {
    /// Computes the closed-form initial estimate the refinement starts from.
    ///
    /// # Errors
    ///
    /// [`StereoError::DegenerateGeometry`] when the observations do not
    /// constrain the linear system.
    fn linear_estimation(&mut self) -> Result<()>;

    /// Refines the current estimate by minimizing the total reprojection error.
    ///
    /// Calls [`Optimizer::linear_estimation`] first when no estimate exists.
    /// With `verbose` set, stage summaries are logged at info level.
    fn optimize(&mut self, verbose: bool) -> Result<()>;

    /// Reprojection statistics of the current estimate.
    fn reprojection_error(&self) -> Result<ProjectionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_projection_error_statistics() {
        let stats = ProjectionError::from_distances(&[1.0, 3.0, 2.0, 4.0]).unwrap();
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.min, 1.0);
        assert_relative_eq!(stats.max, 4.0);
        assert_relative_eq!(stats.rmse, (30.0f64 / 4.0).sqrt());
        assert_relative_eq!(stats.stddev, 1.25f64.sqrt());
        assert!(ProjectionError::from_distances(&[]).is_none());
    }
}
