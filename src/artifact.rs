//! Versioned calibration artifact.
//!
//! Every matrix is stored as a named `rows x cols` block with row-major data,
//! so the file is readable without knowing the crate's types. The format is
//! chosen from the file extension: `.yaml`/`.yml` or `.json`.

use crate::camera::{Intrinsics, RadTanModel, Resolution};
use crate::error::{Result, StereoError};
use crate::optimization::StereoExtrinsics;
use crate::rectification::{PixelRect, RectificationModel};
use log::info;
use nalgebra::storage::RawStorage;
use nalgebra::{Dim, Matrix, SMatrix};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const FORMAT_VERSION: u32 = 1;

/// Row-major matrix with explicit dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedMatrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl NamedMatrix {
    pub fn from_matrix<R: Dim, C: Dim, S: RawStorage<f64, R, C>>(m: &Matrix<f64, R, C, S>) -> Self {
        let (rows, cols) = m.shape();
        NamedMatrix {
            rows,
            cols,
            data: (0..rows)
                .flat_map(|r| (0..cols).map(move |c| m[(r, c)]))
                .collect(),
        }
    }

    /// Converts back to a fixed-size matrix, checking the stored dimensions.
    pub fn to_matrix<const R: usize, const C: usize>(&self, name: &str) -> Result<SMatrix<f64, R, C>> {
        if self.rows != R || self.cols != C || self.data.len() != R * C {
            return Err(StereoError::Serialization(format!(
                "matrix {} must be {}x{} with {} values, found {}x{} with {} values",
                name,
                R,
                C,
                R * C,
                self.rows,
                self.cols,
                self.data.len()
            )));
        }
        Ok(SMatrix::<f64, R, C>::from_row_slice(&self.data))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraBlock {
    pub camera_matrix: NamedMatrix,
    /// `[k1, k2, p1, p2, k3]` as a 1x5 matrix.
    pub dist_coeffs: NamedMatrix,
    pub rms: f64,
}

impl CameraBlock {
    fn new(model: &RadTanModel, rms: f64) -> Self {
        CameraBlock {
            camera_matrix: NamedMatrix::from_matrix(&model.camera_matrix()),
            dist_coeffs: NamedMatrix::from_matrix(&SMatrix::<f64, 1, 5>::from_row_slice(
                &model.distortions,
            )),
            rms,
        }
    }

    fn model(&self, name: &str, resolution: Resolution) -> Result<RadTanModel> {
        let k = self.camera_matrix.to_matrix::<3, 3>(&format!("{} camera_matrix", name))?;
        let d = self.dist_coeffs.to_matrix::<1, 5>(&format!("{} dist_coeffs", name))?;
        Ok(RadTanModel::from_parts(
            Intrinsics::from_matrix(&k),
            resolution,
            [d[0], d[1], d[2], d[3], d[4]],
        ))
    }
}

/// Everything the per-frame stages need from a calibration session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationArtifact {
    pub format_version: u32,
    /// `[width, height]` the rig was calibrated at.
    pub image_size: [u32; 2],
    pub left: CameraBlock,
    pub right: CameraBlock,
    #[serde(rename = "R")]
    pub r: NamedMatrix,
    #[serde(rename = "T")]
    pub t: NamedMatrix,
    #[serde(rename = "E")]
    pub e: NamedMatrix,
    #[serde(rename = "F")]
    pub f: NamedMatrix,
    #[serde(rename = "R1")]
    pub r1: NamedMatrix,
    #[serde(rename = "R2")]
    pub r2: NamedMatrix,
    #[serde(rename = "P1")]
    pub p1: NamedMatrix,
    #[serde(rename = "P2")]
    pub p2: NamedMatrix,
    #[serde(rename = "Q")]
    pub q: NamedMatrix,
    pub roi_left: PixelRect,
    pub roi_right: PixelRect,
    /// Joint reprojection RMS of the stereo solve, in pixels.
    pub stereo_rms: f64,
}

enum Format {
    Yaml,
    Json,
}

fn format_for(path: &Path) -> Result<Format> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("yaml") | Some("yml") => Ok(Format::Yaml),
        Some("json") => Ok(Format::Json),
        _ => Err(StereoError::Serialization(format!(
            "unsupported calibration file extension: {}",
            path.display()
        ))),
    }
}

impl CalibrationArtifact {
    pub fn new(
        left: &RadTanModel,
        right: &RadTanModel,
        extrinsics: &StereoExtrinsics,
        rectification: &RectificationModel,
        rms: [f64; 3],
    ) -> Self {
        let [left_rms, right_rms, stereo_rms] = rms;
        CalibrationArtifact {
            format_version: FORMAT_VERSION,
            image_size: [rectification.image_size.width, rectification.image_size.height],
            left: CameraBlock::new(left, left_rms),
            right: CameraBlock::new(right, right_rms),
            r: NamedMatrix::from_matrix(&extrinsics.rotation),
            t: NamedMatrix::from_matrix(&extrinsics.translation),
            e: NamedMatrix::from_matrix(&extrinsics.essential),
            f: NamedMatrix::from_matrix(&extrinsics.fundamental),
            r1: NamedMatrix::from_matrix(&rectification.r1),
            r2: NamedMatrix::from_matrix(&rectification.r2),
            p1: NamedMatrix::from_matrix(&rectification.p1),
            p2: NamedMatrix::from_matrix(&rectification.p2),
            q: NamedMatrix::from_matrix(&rectification.q),
            roi_left: rectification.roi_left,
            roi_right: rectification.roi_right,
            stereo_rms,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.image_size[0], self.image_size[1])
    }

    pub fn left_model(&self) -> Result<RadTanModel> {
        self.left.model("left", self.resolution())
    }

    pub fn right_model(&self) -> Result<RadTanModel> {
        self.right.model("right", self.resolution())
    }

    pub fn extrinsics(&self) -> Result<StereoExtrinsics> {
        Ok(StereoExtrinsics {
            rotation: self.r.to_matrix::<3, 3>("R")?,
            translation: self.t.to_matrix::<3, 1>("T")?,
            essential: self.e.to_matrix::<3, 3>("E")?,
            fundamental: self.f.to_matrix::<3, 3>("F")?,
        })
    }

    pub fn rectification(&self) -> Result<RectificationModel> {
        Ok(RectificationModel {
            r1: self.r1.to_matrix::<3, 3>("R1")?,
            r2: self.r2.to_matrix::<3, 3>("R2")?,
            p1: self.p1.to_matrix::<3, 4>("P1")?,
            p2: self.p2.to_matrix::<3, 4>("P2")?,
            q: self.q.to_matrix::<4, 4>("Q")?,
            image_size: self.resolution(),
            roi_left: self.roi_left,
            roi_right: self.roi_right,
        })
    }

    /// Checks the version and every matrix shape.
    pub fn validate(&self) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(StereoError::Serialization(format!(
                "unsupported calibration format version {} (expected {})",
                self.format_version, FORMAT_VERSION
            )));
        }
        self.left_model()?;
        self.right_model()?;
        self.extrinsics()?;
        self.rectification()?;
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text = match format_for(path)? {
            Format::Yaml => serde_yaml::to_string(self)?,
            Format::Json => serde_json::to_string_pretty(self)?,
        };
        fs::write(path, text)?;
        info!("calibration written to {}", path.display());
        Ok(())
    }

    /// Loads and validates an artifact.
    ///
    /// # Errors
    ///
    /// [`StereoError::MissingCalibrationArtifact`] if the file does not exist,
    /// [`StereoError::Serialization`] for malformed content, an unknown
    /// version or a matrix with the wrong shape.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StereoError::MissingCalibrationArtifact(
                path.display().to_string(),
            ));
        }
        let format = format_for(path)?;
        let text = fs::read_to_string(path)?;
        let artifact: CalibrationArtifact = match format {
            Format::Yaml => serde_yaml::from_str(&text)?,
            Format::Json => serde_json::from_str(&text)?,
        };
        artifact.validate()?;
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticRig;

    fn artifact() -> CalibrationArtifact {
        let rig = SyntheticRig::default();
        let rectification =
            RectificationModel::build(&rig.left, &rig.right, &rig.extrinsics, rig.resolution, 0.0)
                .unwrap();
        CalibrationArtifact::new(
            &rig.left,
            &rig.right,
            &rig.extrinsics,
            &rectification,
            [0.123456789, 0.1, 1.0 / 3.0],
        )
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("stereo_rig_tools_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_yaml_and_json_round_trip_exactly() {
        let original = artifact();
        for name in ["artifact.yaml", "artifact.json"] {
            let path = temp_path(name);
            original.save(&path).unwrap();
            let loaded = CalibrationArtifact::load(&path).unwrap();
            assert_eq!(loaded, original);
            fs::remove_file(&path).ok();
        }
    }

    #[test]
    fn test_models_rebuild_from_artifact() {
        let rig = SyntheticRig::default();
        let artifact = artifact();
        assert_eq!(artifact.left_model().unwrap(), rig.left);
        assert_eq!(artifact.right_model().unwrap(), rig.right);
        assert_eq!(artifact.extrinsics().unwrap(), rig.extrinsics);
        assert_eq!(artifact.r.data.len(), 9);
        assert_eq!(artifact.p2.cols, 4);
    }

    #[test]
    fn test_missing_file() {
        let result = CalibrationArtifact::load(temp_path("does_not_exist.yaml"));
        assert!(matches!(result, Err(StereoError::MissingCalibrationArtifact(_))));
    }

    #[test]
    fn test_version_and_shape_are_checked() {
        let mut wrong_version = artifact();
        wrong_version.format_version = 2;
        assert!(wrong_version.validate().is_err());

        let mut wrong_shape = artifact();
        wrong_shape.q.rows = 3;
        assert!(matches!(
            wrong_shape.validate(),
            Err(StereoError::Serialization(_))
        ));

        let path = temp_path("artifact.txt");
        assert!(artifact().save(&path).is_err());
    }
}
