//! Planar calibration pattern and its image observations.
//!
//! The pattern is a chessboard described by its inner-corner grid. Its points
//! are enumerated row-major (left-to-right, top-to-bottom) on the `Z = 0` plane
//! and every [`CornerObservation`] lists the detected image points in exactly
//! that order.

use crate::error::{Result, StereoError};
use image::GrayImage;
use log::warn;
use nalgebra::{Vector2, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub mod detector;
pub mod subpix;

pub use detector::{extract, ExtractorParams};

/// Grid of `rows x cols` inner corners with metric `spacing`.
///
/// Square grids are accepted; views rotated near 45 degrees in the image
/// plane are then ambiguous and dropped by [`extract`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPattern {
    pub rows: usize,
    pub cols: usize,
    /// Distance between neighbouring corners, in meters.
    pub spacing: f64,
}

impl Default for CalibrationPattern {
    fn default() -> Self {
        CalibrationPattern {
            rows: 6,
            cols: 9,
            spacing: 0.04,
        }
    }
}

impl CalibrationPattern {
    pub fn new(rows: usize, cols: usize, spacing: f64) -> Result<Self> {
        let pattern = CalibrationPattern {
            rows,
            cols,
            spacing,
        };
        pattern.validate()?;
        Ok(pattern)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rows < 2 || self.cols < 2 {
            return Err(StereoError::InvalidConfig(format!(
                "pattern needs at least 2x2 corners, got {}x{}",
                self.rows, self.cols
            )));
        }
        if !(self.spacing > 0.0 && self.spacing.is_finite()) {
            return Err(StereoError::InvalidConfig(format!(
                "pattern spacing must be positive, got {}",
                self.spacing
            )));
        }
        Ok(())
    }

    pub fn point_count(&self) -> usize {
        self.rows * self.cols
    }

    /// Metric plane coordinates in canonical order.
    pub fn plane_points(&self) -> Vec<Vector2<f64>> {
        (0..self.rows)
            .flat_map(|r| {
                (0..self.cols)
                    .map(move |c| Vector2::new(c as f64 * self.spacing, r as f64 * self.spacing))
            })
            .collect()
    }

    /// 3D pattern points (`Z = 0`) in canonical order.
    pub fn object_points(&self) -> Vec<Vector3<f64>> {
        self.plane_points()
            .into_iter()
            .map(|p| Vector3::new(p.x, p.y, 0.0))
            .collect()
    }
}

/// Detected pattern points of one image in canonical order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CornerObservation {
    pub points: Vec<Vector2<f64>>,
}

impl CornerObservation {
    pub fn new(points: Vec<Vector2<f64>>) -> Self {
        CornerObservation { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn matches(&self, pattern: &CalibrationPattern) -> bool {
        self.points.len() == pattern.point_count()
            && self.points.iter().all(|p| p.x.is_finite() && p.y.is_finite())
    }
}

/// Left and right observations of the pattern taken at the same instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoObservationPair {
    pub left: CornerObservation,
    pub right: CornerObservation,
}

impl StereoObservationPair {
    /// Keeps the pair only if both observations are present and complete.
    pub fn new(
        pattern: &CalibrationPattern,
        left: Option<CornerObservation>,
        right: Option<CornerObservation>,
    ) -> Option<Self> {
        match (left, right) {
            (Some(left), Some(right)) if left.matches(pattern) && right.matches(pattern) => {
                Some(StereoObservationPair { left, right })
            }
            _ => None,
        }
    }
}

/// Runs the extractor over a batch of images in parallel.
///
/// The output keeps the input order; failed detections are `None` and logged.
pub fn extract_batch(
    images: &[GrayImage],
    pattern: &CalibrationPattern,
    params: &ExtractorParams,
) -> Vec<Option<CornerObservation>> {
    images
        .par_iter()
        .enumerate()
        .map(|(index, image)| {
            let observation = extract(image, pattern, params);
            if observation.is_none() {
                warn!("pattern not found in image {}, skipping", index);
            }
            observation
        })
        .collect()
}

/// Extracts both images of every stereo pair and keeps the pairs seen by both cameras.
pub fn extract_stereo_batch(
    pairs: &[(GrayImage, GrayImage)],
    pattern: &CalibrationPattern,
    params: &ExtractorParams,
) -> Vec<StereoObservationPair> {
    pairs
        .par_iter()
        .enumerate()
        .filter_map(|(index, (left, right))| {
            let (left_obs, right_obs) = rayon::join(
                || extract(left, pattern, params),
                || extract(right, pattern, params),
            );
            let pair = StereoObservationPair::new(pattern, left_obs, right_obs);
            if pair.is_none() {
                warn!("pattern not found in both images of pair {}, skipping", index);
            }
            pair
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_points_are_row_major() {
        let pattern = CalibrationPattern::default();
        let points = pattern.object_points();
        assert_eq!(points.len(), 54);
        assert_eq!(points[0], Vector3::new(0.0, 0.0, 0.0));
        assert_eq!(points[1], Vector3::new(0.04, 0.0, 0.0));
        assert_eq!(points[9], Vector3::new(0.0, 0.04, 0.0));
        assert!((points[53] - Vector3::new(0.32, 0.2, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_pattern_validation() {
        assert!(CalibrationPattern::new(6, 9, 0.04).is_ok());
        assert!(CalibrationPattern::new(5, 5, 0.04).is_ok());
        assert!(CalibrationPattern::new(1, 9, 0.04).is_err());
        assert!(CalibrationPattern::new(6, 9, 0.0).is_err());
    }

    #[test]
    fn test_stereo_pair_requires_both_views() {
        let pattern = CalibrationPattern::new(2, 3, 0.1).unwrap();
        let full = CornerObservation::new(vec![Vector2::new(1.0, 1.0); 6]);
        let short = CornerObservation::new(vec![Vector2::new(1.0, 1.0); 5]);

        assert!(StereoObservationPair::new(&pattern, Some(full.clone()), Some(full.clone())).is_some());
        assert!(StereoObservationPair::new(&pattern, Some(full.clone()), None).is_none());
        assert!(StereoObservationPair::new(&pattern, None, Some(full.clone())).is_none());
        assert!(StereoObservationPair::new(&pattern, Some(full), Some(short)).is_none());
    }
}
