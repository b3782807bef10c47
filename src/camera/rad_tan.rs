//! Implements the Radial-Tangential (RadTan) camera model.
//!
//! This module provides the [`RadTanModel`] struct, the per-camera model of the
//! stereo rig. It uses the Brown-Conrady distortion with three radial
//! (`k1`, `k2`, `k3`) and two tangential (`p1`, `p2`) coefficients, stored in the
//! `[k1, k2, p1, p2, k3]` order used by most calibration toolchains.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{DVector, Matrix2, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::{fmt, fs, io::Write};
use yaml_rust::YamlLoader;

/// Convergence tolerance of the iterative distortion inversion.
const UNDISTORT_EPS: f64 = 1e-12;
const UNDISTORT_MAX_ITERATIONS: usize = 100;

/// Represents a Radial-Tangential (RadTan) camera model.
///
/// # Examples
///
/// ```rust
/// use nalgebra::Vector3;
/// use stereo_rig_tools::camera::{CameraModel, Intrinsics, RadTanModel, Resolution};
///
/// let model = RadTanModel::from_parts(
///     Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 },
///     Resolution { width: 640, height: 480 },
///     [-0.1, 0.01, 0.0, 0.0, 0.0],
/// );
/// let pixel = model.project(&Vector3::new(0.1, -0.05, 1.0)).unwrap();
/// assert!(pixel.x > 320.0 && pixel.y < 240.0);
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RadTanModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
    /// The 5 distortion coefficients: `[k1, k2, p1, p2, k3]`.
    pub distortions: [f64; 5],
}

impl RadTanModel {
    /// Creates a new [`RadTanModel`] from a parameter vector
    /// `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
    ///
    /// The resolution is initialized to 0x0 and should be set by the caller.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidParams`] if fewer than 9 parameters are given.
    /// * [`CameraModelError::FocalLengthMustBePositive`] and
    ///   [`CameraModelError::PrincipalPointMustBeFinite`] from `validate_params`.
    pub fn new(parameters: &DVector<f64>) -> Result<Self, CameraModelError> {
        if parameters.len() < 9 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected 9 RadTan parameters, got {}",
                parameters.len()
            )));
        }
        let model = RadTanModel {
            intrinsics: Intrinsics {
                fx: parameters[0],
                fy: parameters[1],
                cx: parameters[2],
                cy: parameters[3],
            },
            resolution: Resolution {
                width: 0,
                height: 0,
            },
            distortions: [
                parameters[4],
                parameters[5],
                parameters[6],
                parameters[7],
                parameters[8],
            ],
        };

        model.validate_params()?;
        Ok(model)
    }

    pub fn from_parts(intrinsics: Intrinsics, resolution: Resolution, distortions: [f64; 5]) -> Self {
        RadTanModel {
            intrinsics,
            resolution,
            distortions,
        }
    }

    /// A distortion-free camera with the given intrinsics.
    pub fn pinhole(intrinsics: Intrinsics, resolution: Resolution) -> Self {
        Self::from_parts(intrinsics, resolution, [0.0; 5])
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.intrinsics.to_matrix()
    }

    /// Packs the model into `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
    pub fn params(&self) -> [f64; 9] {
        let d = &self.distortions;
        [
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            d[0],
            d[1],
            d[2],
            d[3],
            d[4],
        ]
    }

    /// Inverse of [`RadTanModel::params`], keeping the current resolution.
    pub fn with_params(&self, params: &[f64]) -> Self {
        RadTanModel {
            intrinsics: Intrinsics {
                fx: params[0],
                fy: params[1],
                cx: params[2],
                cy: params[3],
            },
            resolution: self.resolution,
            distortions: [params[4], params[5], params[6], params[7], params[8]],
        }
    }

    /// Applies the lens distortion to an undistorted normalized image point.
    pub fn distort_normalized(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortions;
        let (x, y) = (point.x, point.y);

        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;

        Vector2::new(
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// Finds the undistorted normalized point whose distortion equals `target`.
    ///
    /// Radial-tangential distortion has no closed-form inverse, so the point is
    /// found with Newton iterations on the 2x2 distortion Jacobian, starting
    /// from the distorted point itself.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::NumericalError`] if the Jacobian becomes singular or
    /// the iteration does not settle within the iteration cap.
    pub fn undistort_normalized(
        &self,
        target: &Vector2<f64>,
    ) -> Result<Vector2<f64>, CameraModelError> {
        let [k1, k2, p1, p2, k3] = self.distortions;
        if self.distortions.iter().all(|d| *d == 0.0) {
            return Ok(*target);
        }

        let mut point = *target;
        for _ in 0..UNDISTORT_MAX_ITERATIONS {
            let error = self.distort_normalized(&point) - target;
            if error.norm() < UNDISTORT_EPS {
                return Ok(point);
            }

            let (x, y) = (point.x, point.y);
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r4 * r2;
            // derivative of the radial factor with respect to r^2
            let d_radial = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

            let j00 = radial + 2.0 * x * x * d_radial + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j10 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j11 = radial + 2.0 * y * y * d_radial + 6.0 * p1 * y + 2.0 * p2 * x;
            let jacobian = Matrix2::new(j00, j01, j10, j11);

            let delta = jacobian.try_inverse().ok_or_else(|| {
                CameraModelError::NumericalError("Distortion Jacobian is singular".to_string())
            })? * error;
            point -= delta;

            if !point.x.is_finite() || !point.y.is_finite() {
                break;
            }
            if delta.norm() < UNDISTORT_EPS {
                return Ok(point);
            }
        }

        let residual = (self.distort_normalized(&point) - target).norm();
        if residual.is_finite() && residual < 1e-9 {
            return Ok(point);
        }
        Err(CameraModelError::NumericalError(format!(
            "Undistortion did not converge after {} iterations",
            UNDISTORT_MAX_ITERATIONS
        )))
    }

    /// Pixel to normalized undistorted coordinates.
    pub fn pixel_to_normalized(
        &self,
        pixel: &Vector2<f64>,
    ) -> Result<Vector2<f64>, CameraModelError> {
        let distorted = Vector2::new(
            (pixel.x - self.intrinsics.cx) / self.intrinsics.fx,
            (pixel.y - self.intrinsics.cy) / self.intrinsics.fy,
        );
        self.undistort_normalized(&distorted)
    }

    /// Normalized undistorted coordinates to pixel coordinates.
    pub fn normalized_to_pixel(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let distorted = self.distort_normalized(point);
        Vector2::new(
            self.intrinsics.fx * distorted.x + self.intrinsics.cx,
            self.intrinsics.fy * distorted.y + self.intrinsics.cy,
        )
    }

    /// Projects without checking the image bounds.
    ///
    /// Calibration residuals need a prediction even when the current estimate
    /// pushes a pattern point slightly outside the sensor.
    pub fn project_unbounded(
        &self,
        point_3d: &Vector3<f64>,
    ) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        let normalized = Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z);
        Ok(self.normalized_to_pixel(&normalized))
    }
}

impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

fn yaml_f64(node: &yaml_rust::Yaml, name: &str) -> Result<f64, CameraModelError> {
    // integers written without a decimal point are still valid parameters
    node.as_f64()
        .or_else(|| node.as_i64().map(|v| v as f64))
        .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {}", name)))
}

impl CameraModel for RadTanModel {
    /// Projects a 3D point from camera coordinates to pixel coordinates.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: the point's Z-coordinate is too close to zero.
    /// * [`CameraModelError::ProjectionOutSideImage`]: the projection falls outside the resolution.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let pixel = self.project_unbounded(point_3d)?;
        if !self.resolution.contains(&pixel) {
            return Err(CameraModelError::ProjectionOutSideImage);
        }
        Ok(pixel)
    }

    /// Unprojects a distorted pixel to a unit viewing ray.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointIsOutSideImage`]: the pixel lies outside the resolution.
    /// * [`CameraModelError::NumericalError`]: the distortion could not be inverted.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if !self.resolution.contains(point_2d) {
            return Err(CameraModelError::PointIsOutSideImage);
        }
        let normalized = self.pixel_to_normalized(point_2d)?;
        Ok(Vector3::new(normalized.x, normalized.y, 1.0).normalize())
    }

    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;

        if docs.is_empty() {
            return Err(CameraModelError::InvalidParams(
                "Empty YAML document".to_string(),
            ));
        }

        let cam = &docs[0]["cam0"];

        let intrinsics_yaml = cam["intrinsics"]
            .as_vec()
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid intrinsics".to_string()))?;
        let resolution_yaml = cam["resolution"]
            .as_vec()
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid resolution".to_string()))?;
        let distortion_yaml = cam["distortion"].as_vec().ok_or_else(|| {
            CameraModelError::InvalidParams("Missing distortion parameters".to_string())
        })?;

        if intrinsics_yaml.len() != 4 || resolution_yaml.len() != 2 {
            return Err(CameraModelError::InvalidParams(
                "Expected 4 intrinsics and 2 resolution values".to_string(),
            ));
        }
        if distortion_yaml.len() != 5 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected 5 distortion parameters in YAML, found {}",
                distortion_yaml.len()
            )));
        }

        let intrinsics = Intrinsics {
            fx: yaml_f64(&intrinsics_yaml[0], "fx")?,
            fy: yaml_f64(&intrinsics_yaml[1], "fy")?,
            cx: yaml_f64(&intrinsics_yaml[2], "cx")?,
            cy: yaml_f64(&intrinsics_yaml[3], "cy")?,
        };

        let resolution = Resolution {
            width: resolution_yaml[0]
                .as_i64()
                .ok_or_else(|| CameraModelError::InvalidParams("Invalid width".to_string()))?
                as u32,
            height: resolution_yaml[1]
                .as_i64()
                .ok_or_else(|| CameraModelError::InvalidParams("Invalid height".to_string()))?
                as u32,
        };

        let mut distortions = [0.0; 5];
        for (i, param) in distortion_yaml.iter().enumerate() {
            distortions[i] = yaml_f64(param, &format!("distortion parameter at index {}", i))?;
        }

        let model = RadTanModel {
            intrinsics,
            resolution,
            distortions,
        };
        model.validate_params()?;

        Ok(model)
    }

    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        let to_value = |v: serde_yaml::Result<serde_yaml::Value>| {
            v.map_err(|e| CameraModelError::YamlError(e.to_string()))
        };

        let mut cam = serde_yaml::Mapping::new();
        cam.insert("camera_model".into(), "radtan".into());
        cam.insert(
            "intrinsics".into(),
            to_value(serde_yaml::to_value(vec![
                self.intrinsics.fx,
                self.intrinsics.fy,
                self.intrinsics.cx,
                self.intrinsics.cy,
            ]))?,
        );
        cam.insert(
            "distortion".into(),
            to_value(serde_yaml::to_value(self.distortions.to_vec()))?,
        );
        cam.insert("rostopic".into(), "/cam0/image_raw".into());
        cam.insert(
            "resolution".into(),
            to_value(serde_yaml::to_value(vec![
                self.resolution.width,
                self.resolution.height,
            ]))?,
        );

        let mut root = serde_yaml::Mapping::new();
        root.insert("cam0".into(), serde_yaml::Value::Mapping(cam));

        let yaml_string =
            serde_yaml::to_string(&root).map_err(|e| CameraModelError::YamlError(e.to_string()))?;

        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;

        Ok(())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_distortion(&self.distortions)?;
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_model() -> RadTanModel {
        RadTanModel::from_parts(
            Intrinsics {
                fx: 461.629,
                fy: 460.152,
                cx: 362.680,
                cy: 246.049,
            },
            Resolution {
                width: 752,
                height: 480,
            },
            [-0.28340811, 0.07395907, 0.00019359, 1.76187114e-05, 0.0],
        )
    }

    #[test]
    fn test_radtan_new_rejects_short_vector() {
        let params = DVector::from_vec(vec![400.0, 400.0, 320.0]);
        assert!(matches!(
            RadTanModel::new(&params),
            Err(CameraModelError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_radtan_save_and_load_yaml() {
        let model = sample_model();
        let path = std::env::temp_dir().join("stereo_rig_tools_rad_tan_saved.yaml");
        let path = path.to_str().unwrap();

        model.save_to_yaml(path).unwrap();
        let loaded = RadTanModel::load_from_yaml(path).unwrap();
        assert_eq!(model, loaded);

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_radtan_project_unproject() {
        let model = sample_model();
        let point_3d = Vector3::new(0.5, -0.3, 2.0);

        let point_2d = model.project(&point_3d).unwrap();
        assert!(model.resolution.contains(&point_2d));

        let ray = model.unproject(&point_2d).unwrap();
        assert_relative_eq!(ray, point_3d.normalize(), epsilon = 1e-9);
    }

    #[test]
    fn test_radtan_undistort_inverts_distort() {
        let model = sample_model();
        for &(x, y) in &[(0.0, 0.0), (0.3, -0.2), (-0.45, 0.3), (0.6, 0.4)] {
            let undistorted = Vector2::new(x, y);
            let distorted = model.distort_normalized(&undistorted);
            let recovered = model.undistort_normalized(&distorted).unwrap();
            assert_relative_eq!(recovered, undistorted, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_radtan_projection_outside_image() {
        let model = sample_model();
        assert!(matches!(
            model.project(&Vector3::new(0.0, 0.0, 0.0)),
            Err(CameraModelError::PointAtCameraCenter)
        ));
        assert!(matches!(
            model.project(&Vector3::new(5.0, 0.0, 1.0)),
            Err(CameraModelError::ProjectionOutSideImage)
        ));
    }

    #[test]
    fn test_radtan_params_round_trip() {
        let model = sample_model();
        let params = model.params();
        assert_eq!(model.with_params(&params), model);
        let rebuilt = RadTanModel::new(&DVector::from_row_slice(&params)).unwrap();
        assert_eq!(rebuilt.distortions, model.distortions);
    }
}
