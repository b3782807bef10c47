//! Calibration session and the per-frame rig.
//!
//! A [`CalibrationSession`] accumulates stereo observations of the pattern
//! and turns them into a [`CalibrationResult`] in one batch. The result (or
//! a previously saved [`CalibrationArtifact`]) then becomes an immutable
//! [`StereoRig`] that rectifies frames and computes disparity maps. A rig
//! can be shared between threads.

use crate::artifact::CalibrationArtifact;
use crate::camera::{RadTanModel, Resolution};
use crate::config::RigConfig;
use crate::error::{Result, StereoError};
use crate::optimization::{
    calibrate_intrinsics, calibrate_stereo, IntrinsicCalibration, StereoCalibration,
};
use crate::pattern::{self, CalibrationPattern, CornerObservation, StereoObservationPair};
use crate::rectification::RectificationModel;
use crate::remap::{remap, RemapTable};
use crate::stereo::{self, DisparityMap, SgbmParams};
use image::{GrayImage, ImageBuffer, Pixel};
use log::{info, warn};
use std::path::Path;

fn check_size(expected: Resolution, actual: (u32, u32)) -> Result<()> {
    if (expected.width, expected.height) != actual {
        return Err(StereoError::SizeMismatch {
            expected: (expected.width, expected.height),
            actual,
        });
    }
    Ok(())
}

pub struct CalibrationSession {
    config: RigConfig,
    image_size: Resolution,
    pairs: Vec<StereoObservationPair>,
}

impl CalibrationSession {
    pub fn new(config: RigConfig, image_size: Resolution) -> Result<Self> {
        config.validate()?;
        if image_size.width == 0 || image_size.height == 0 {
            return Err(StereoError::InvalidConfig(
                "session image size must be non-empty".to_string(),
            ));
        }
        Ok(CalibrationSession {
            config,
            image_size,
            pairs: Vec::new(),
        })
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    pub fn pattern(&self) -> &CalibrationPattern {
        &self.config.pattern
    }

    pub fn image_size(&self) -> Resolution {
        self.image_size
    }

    pub fn pairs(&self) -> &[StereoObservationPair] {
        &self.pairs
    }

    /// Stores a pair if both observations are present and complete.
    pub fn add_pair(
        &mut self,
        left: Option<CornerObservation>,
        right: Option<CornerObservation>,
    ) -> bool {
        match StereoObservationPair::new(&self.config.pattern, left, right) {
            Some(pair) => {
                self.pairs.push(pair);
                true
            }
            None => false,
        }
    }

    /// Extracts the pattern from both images and stores the pair.
    ///
    /// # Errors
    ///
    /// * [`StereoError::SizeMismatch`] if an image differs from the session size.
    /// * [`StereoError::DetectionFailure`] if either image does not show the
    ///   whole pattern. The session is unchanged and can keep going.
    pub fn add_images(&mut self, left: &GrayImage, right: &GrayImage) -> Result<()> {
        check_size(self.image_size, left.dimensions())?;
        check_size(self.image_size, right.dimensions())?;
        let (board, params) = (&self.config.pattern, &self.config.extractor);
        let (left_obs, right_obs) = rayon::join(
            || pattern::extract(left, board, params),
            || pattern::extract(right, board, params),
        );
        let reason = match (&left_obs, &right_obs) {
            (None, None) => "pattern not found in either image",
            (None, Some(_)) => "pattern not found in the left image",
            (Some(_), None) => "pattern not found in the right image",
            (Some(_), Some(_)) => "",
        };
        if !self.add_pair(left_obs, right_obs) {
            return Err(StereoError::DetectionFailure {
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    /// Extracts a whole capture batch in parallel and returns how many pairs
    /// were kept. Pairs of the wrong size or without a full detection are
    /// skipped with a warning.
    pub fn add_image_batch(&mut self, images: &[(GrayImage, GrayImage)]) -> usize {
        let sized: Vec<(GrayImage, GrayImage)> = images
            .iter()
            .enumerate()
            .filter(|(index, (left, right))| {
                let ok = check_size(self.image_size, left.dimensions()).is_ok()
                    && check_size(self.image_size, right.dimensions()).is_ok();
                if !ok {
                    warn!("pair {} does not match the session image size, skipping", index);
                }
                ok
            })
            .map(|(_, pair)| pair.clone())
            .collect();
        let found = pattern::extract_stereo_batch(&sized, &self.config.pattern, &self.config.extractor);
        let kept = found.len();
        self.pairs.extend(found);
        info!("kept {} of {} image pairs", kept, images.len());
        kept
    }

    /// Calibrates both cameras, the rig and the rectification.
    ///
    /// # Errors
    ///
    /// Propagates the calibrator errors, in particular
    /// [`StereoError::InsufficientObservations`] when fewer pairs than
    /// `calibration.min_observations` were collected.
    pub fn calibrate(&self) -> Result<CalibrationResult> {
        let pattern = &self.config.pattern;
        let required = self.config.calibration.min_observations;
        if self.pairs.len() < required {
            return Err(StereoError::InsufficientObservations {
                found: self.pairs.len(),
                required,
            });
        }
        info!("calibrating from {} stereo pairs", self.pairs.len());

        let lefts: Vec<CornerObservation> = self.pairs.iter().map(|p| p.left.clone()).collect();
        let rights: Vec<CornerObservation> = self.pairs.iter().map(|p| p.right.clone()).collect();
        let intrinsic_options = self.config.calibration.intrinsic();
        let (left, right) = rayon::join(
            || calibrate_intrinsics(pattern, &lefts, self.image_size, &intrinsic_options),
            || calibrate_intrinsics(pattern, &rights, self.image_size, &intrinsic_options),
        );
        let (left, right) = (left?, right?);
        info!("left camera rms {:.4} px, right camera rms {:.4} px", left.rms, right.rms);

        let stereo = calibrate_stereo(
            pattern,
            &self.pairs,
            &left.model,
            &right.model,
            self.image_size,
            &self.config.calibration.stereo(),
        )?;
        info!(
            "stereo rms {:.4} px, baseline {:.4}",
            stereo.rms,
            stereo.extrinsics.baseline()
        );

        let rectification = RectificationModel::build(
            &stereo.left,
            &stereo.right,
            &stereo.extrinsics,
            self.image_size,
            self.config.rectification.alpha,
        )?;

        Ok(CalibrationResult {
            left,
            right,
            stereo,
            rectification,
        })
    }
}

/// Output of [`CalibrationSession::calibrate`].
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    pub left: IntrinsicCalibration,
    pub right: IntrinsicCalibration,
    pub stereo: StereoCalibration,
    pub rectification: RectificationModel,
}

impl CalibrationResult {
    /// Final camera models, after the stereo solve.
    pub fn models(&self) -> (&RadTanModel, &RadTanModel) {
        (&self.stereo.left, &self.stereo.right)
    }

    pub fn to_artifact(&self) -> CalibrationArtifact {
        CalibrationArtifact::new(
            &self.stereo.left,
            &self.stereo.right,
            &self.stereo.extrinsics,
            &self.rectification,
            [self.left.rms, self.right.rms, self.stereo.rms],
        )
    }
}

/// A calibrated rig ready for per-frame rectification and disparity.
#[derive(Debug, Clone)]
pub struct StereoRig {
    rectification: RectificationModel,
    left_table: RemapTable,
    right_table: RemapTable,
    disparity: SgbmParams,
}

impl StereoRig {
    pub fn new(
        left: &RadTanModel,
        right: &RadTanModel,
        rectification: RectificationModel,
        disparity: SgbmParams,
    ) -> Result<Self> {
        disparity.validate()?;
        let (left_table, right_table) = rectification.remap_tables(left, right)?;
        Ok(StereoRig {
            rectification,
            left_table,
            right_table,
            disparity,
        })
    }

    pub fn from_result(result: &CalibrationResult, disparity: SgbmParams) -> Result<Self> {
        let (left, right) = result.models();
        StereoRig::new(left, right, result.rectification.clone(), disparity)
    }

    pub fn from_artifact(artifact: &CalibrationArtifact, disparity: SgbmParams) -> Result<Self> {
        artifact.validate()?;
        StereoRig::new(
            &artifact.left_model()?,
            &artifact.right_model()?,
            artifact.rectification()?,
            disparity,
        )
    }

    /// Loads a saved artifact.
    ///
    /// # Errors
    ///
    /// [`StereoError::MissingCalibrationArtifact`] if `path` does not exist.
    pub fn load<P: AsRef<Path>>(path: P, disparity: SgbmParams) -> Result<Self> {
        StereoRig::from_artifact(&CalibrationArtifact::load(path)?, disparity)
    }

    pub fn rectification(&self) -> &RectificationModel {
        &self.rectification
    }

    pub fn image_size(&self) -> Resolution {
        self.rectification.image_size
    }

    pub fn disparity_params(&self) -> &SgbmParams {
        &self.disparity
    }

    /// Undistorts and rectifies a raw frame pair.
    ///
    /// # Errors
    ///
    /// [`StereoError::SizeMismatch`] if a frame differs from the calibrated size.
    pub fn rectify_pair<P>(
        &self,
        left: &ImageBuffer<P, Vec<u8>>,
        right: &ImageBuffer<P, Vec<u8>>,
    ) -> Result<(ImageBuffer<P, Vec<u8>>, ImageBuffer<P, Vec<u8>>)>
    where
        P: Pixel<Subpixel = u8> + Send + Sync,
    {
        check_size(self.image_size(), left.dimensions())?;
        check_size(self.image_size(), right.dimensions())?;
        let (left, right) = rayon::join(
            || remap(left, &self.left_table),
            || remap(right, &self.right_table),
        );
        Ok((left?, right?))
    }

    /// Rectifies a raw grayscale pair and computes its disparity map.
    pub fn compute_disparity(&self, left: &GrayImage, right: &GrayImage) -> Result<DisparityMap> {
        let (left, right) = self.rectify_pair(left, right)?;
        let map = stereo::compute(&left, &right, &self.disparity)?;
        info!(
            "disparity map {}x{} with {} valid pixels",
            map.width,
            map.height,
            map.valid_count()
        );
        Ok(map)
    }
}
