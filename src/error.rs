//! Error types shared by the calibration, rectification and disparity stages.
//!
//! Detection failures are recovered locally by callers (the frame is skipped),
//! while solver and artifact failures are propagated as [`StereoError`] values
//! that carry the diagnostic metric available at the point of failure.

use crate::camera::CameraModelError;

#[derive(thiserror::Error, Debug)]
pub enum StereoError {
    #[error("Pattern detection failed: {reason}")]
    DetectionFailure { reason: String },
    #[error("Insufficient observations: found {found}, at least {required} required")]
    InsufficientObservations { found: usize, required: usize },
    #[error("Degenerate geometry: {reason} (condition number {condition_number:e})")]
    DegenerateGeometry { reason: String, condition_number: f64 },
    #[error("Solver did not converge after {iterations} iterations (last rms {rms:.6} px)")]
    ConvergenceFailure { iterations: usize, rms: f64 },
    #[error("No calibration artifact loaded: {0}")]
    MissingCalibrationArtifact(String),
    #[error("Image size mismatch: expected {expected:?}, got {actual:?}")]
    SizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO Error: {0}")]
    Io(String),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
}

impl From<std::io::Error> for StereoError {
    fn from(err: std::io::Error) -> Self {
        StereoError::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for StereoError {
    fn from(err: serde_yaml::Error) -> Self {
        StereoError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StereoError {
    fn from(err: serde_json::Error) -> Self {
        StereoError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StereoError>;
