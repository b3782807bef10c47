//! Rig-wide configuration.
//!
//! All policy constants of the pipeline live in one [`RigConfig`] so that a
//! capture setup can be described by a single YAML file. Missing sections and
//! fields fall back to their defaults.

use crate::error::{Result, StereoError};
use crate::optimization::{IntrinsicOptions, SolverOptions, StereoOptions};
use crate::pattern::{CalibrationPattern, ExtractorParams};
use crate::stereo::SgbmParams;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationOptions {
    /// Minimum number of usable pattern views, per camera and per pair.
    pub min_observations: usize,
    /// Keep the single-camera results constant during the stereo solve.
    pub fix_intrinsics: bool,
    pub intrinsic_solver: SolverOptions,
    pub stereo_solver: SolverOptions,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        CalibrationOptions {
            min_observations: 3,
            fix_intrinsics: true,
            intrinsic_solver: SolverOptions::default(),
            stereo_solver: SolverOptions {
                max_iterations: 100,
                xtol: 1e-5,
                ..SolverOptions::default()
            },
        }
    }
}

impl CalibrationOptions {
    pub fn intrinsic(&self) -> IntrinsicOptions {
        IntrinsicOptions {
            min_observations: self.min_observations,
            solver: self.intrinsic_solver,
        }
    }

    pub fn stereo(&self) -> StereoOptions {
        StereoOptions {
            min_observations: self.min_observations,
            fix_intrinsics: self.fix_intrinsics,
            solver: self.stereo_solver,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RectificationOptions {
    /// 0 keeps only valid pixels, 1 keeps every source pixel. Clamped to `[0, 1]`.
    pub alpha: f64,
}

impl Default for RectificationOptions {
    fn default() -> Self {
        RectificationOptions { alpha: 0.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RigConfig {
    pub pattern: CalibrationPattern,
    pub extractor: ExtractorParams,
    pub calibration: CalibrationOptions,
    pub rectification: RectificationOptions,
    pub disparity: SgbmParams,
}

impl RigConfig {
    pub fn validate(&self) -> Result<()> {
        self.pattern.validate()?;
        self.disparity.validate()?;

        let extractor = &self.extractor;
        if extractor.window_half_size == 0 || extractor.max_iterations == 0 {
            return Err(StereoError::InvalidConfig(
                "extractor window and iteration count must be positive".to_string(),
            ));
        }
        if !(extractor.epsilon > 0.0) || !(extractor.blur_sigma >= 0.0) {
            return Err(StereoError::InvalidConfig(format!(
                "extractor epsilon must be positive and blur sigma non-negative, got {} and {}",
                extractor.epsilon, extractor.blur_sigma
            )));
        }
        if !(extractor.response_threshold > 0.0 && extractor.response_threshold < 1.0) {
            return Err(StereoError::InvalidConfig(format!(
                "extractor response_threshold must be in (0, 1), got {}",
                extractor.response_threshold
            )));
        }

        if self.calibration.min_observations == 0 {
            return Err(StereoError::InvalidConfig(
                "min_observations must be at least 1".to_string(),
            ));
        }
        for (name, solver) in [
            ("intrinsic", &self.calibration.intrinsic_solver),
            ("stereo", &self.calibration.stereo_solver),
        ] {
            if solver.max_iterations == 0 || !(solver.xtol > 0.0) {
                return Err(StereoError::InvalidConfig(format!(
                    "{} solver needs a positive iteration cap and tolerance",
                    name
                )));
            }
        }

        if !self.rectification.alpha.is_finite() {
            return Err(StereoError::InvalidConfig(format!(
                "rectification alpha must be finite, got {}",
                self.rectification.alpha
            )));
        }
        Ok(())
    }

    /// Reads and validates a YAML configuration.
    pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: RigConfig = serde_yaml::from_str(&text)?;
        config.validate()?;
        info!("configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn save_to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}
