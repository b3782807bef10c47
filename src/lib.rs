//! Stereo Rig Tools Library
//!
//! Calibration, rectification and dense disparity for a two-camera rig.
//! The library covers the whole offline pipeline:
//! - Chessboard corner extraction with sub-pixel refinement
//! - Single-camera calibration with the radial-tangential distortion model
//! - Stereo extrinsic calibration and OpenCV-compatible rectification
//! - Undistort-rectify lookup tables and image remapping
//! - Semi-global block matching and reprojection to 3D
//!
//! A calibration run is held in an explicit [`CalibrationSession`]; its
//! result is persisted as a versioned [`CalibrationArtifact`] and loaded back
//! into a [`StereoRig`] for per-frame processing.

pub mod artifact;
pub mod camera;
pub mod config;
pub mod error;
pub mod geometry;
pub mod optimization;
pub mod pattern;
pub mod rectification;
pub mod remap;
pub mod session;
pub mod stereo;
pub mod synthetic;

// Re-export commonly used types
pub use artifact::CalibrationArtifact;
pub use camera::{CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution};
pub use config::RigConfig;
pub use error::{Result, StereoError};
pub use optimization::{
    calibrate_intrinsics, calibrate_stereo, IntrinsicCalibration, ProjectionError,
    StereoCalibration, StereoExtrinsics,
};
pub use pattern::{CalibrationPattern, CornerObservation, ExtractorParams, StereoObservationPair};
pub use rectification::{PixelRect, RectificationModel};
pub use remap::{build_remap, remap, undistort_points, RemapTable};
pub use session::{CalibrationResult, CalibrationSession, StereoRig};
pub use stereo::{DisparityMap, PathMode, SgbmParams};
