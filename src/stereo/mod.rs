//! Dense disparity from a rectified image pair.
//!
//! [`compute`] runs semi-global block matching: a windowed
//! Birchfield-Tomasi matching cost over a `num_disparities` deep cost volume,
//! smoothness aggregation along four or eight scanline directions, a
//! winner-take-all choice with parabolic sub-pixel refinement and finally a
//! uniqueness test and a left-right consistency check.

use crate::error::{Result, StereoError};
use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

mod sgbm;

/// Fixed-point scale of [`DisparityMap`] values.
pub const DISP_SCALE: i16 = 16;

/// Channel count the default smoothness penalties are scaled for.
const PENALTY_CHANNELS: u32 = 3;

/// Aggregation directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMode {
    /// Horizontal and vertical scanlines.
    Four,
    /// Adds the four diagonals.
    Eight,
}

impl PathMode {
    pub(crate) fn directions(&self) -> &'static [(i32, i32)] {
        const FOUR: [(i32, i32); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];
        const EIGHT: [(i32, i32); 8] = [
            (1, 0),
            (-1, 0),
            (0, 1),
            (0, -1),
            (1, 1),
            (-1, 1),
            (1, -1),
            (-1, -1),
        ];
        match self {
            PathMode::Four => &FOUR,
            PathMode::Eight => &EIGHT,
        }
    }
}

/// Semi-global matching parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgbmParams {
    pub min_disparity: i32,
    /// Size of the disparity search range; a positive multiple of 16.
    pub num_disparities: usize,
    /// Odd side length of the matching window.
    pub block_size: usize,
    /// Penalty for a disparity change of one pixel between neighbours.
    pub p1: u32,
    /// Penalty for larger disparity changes, reduced across intensity edges.
    pub p2: u32,
    /// Percentage by which the best cost must beat every other
    /// non-adjacent candidate.
    pub uniqueness_ratio: u32,
    /// Largest allowed left-right disagreement in pixels; negative disables
    /// the check.
    pub disp12_max_diff: i32,
    /// Clip value of the horizontal derivative used in the matching cost.
    pub pre_filter_cap: u32,
    pub paths: PathMode,
}

impl Default for SgbmParams {
    fn default() -> Self {
        SgbmParams::with_block_size(0, 128, 5)
    }
}

impl SgbmParams {
    /// Parameters with the customary `P1 = 8 * cn * block_size^2` and
    /// `P2 = 32 * cn * block_size^2` penalties for `cn = 3` color channels,
    /// the setting used for the rig's three-channel captures.
    pub fn with_block_size(min_disparity: i32, num_disparities: usize, block_size: usize) -> Self {
        let area = (block_size * block_size) as u32 * PENALTY_CHANNELS;
        SgbmParams {
            min_disparity,
            num_disparities,
            block_size,
            p1: 8 * area,
            p2: 32 * area,
            uniqueness_ratio: 10,
            disp12_max_diff: 1,
            pre_filter_cap: 63,
            paths: PathMode::Eight,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_disparities == 0 || self.num_disparities % 16 != 0 {
            return Err(StereoError::InvalidConfig(format!(
                "num_disparities must be a positive multiple of 16, got {}",
                self.num_disparities
            )));
        }
        if self.block_size == 0 || self.block_size % 2 == 0 {
            return Err(StereoError::InvalidConfig(format!(
                "block_size must be odd, got {}",
                self.block_size
            )));
        }
        if self.p2 < self.p1 {
            return Err(StereoError::InvalidConfig(format!(
                "P2 ({}) must not be smaller than P1 ({})",
                self.p2, self.p1
            )));
        }
        if self.uniqueness_ratio >= 100 {
            return Err(StereoError::InvalidConfig(format!(
                "uniqueness_ratio is a percentage below 100, got {}",
                self.uniqueness_ratio
            )));
        }
        if self.pre_filter_cap == 0 || self.pre_filter_cap > 255 {
            return Err(StereoError::InvalidConfig(format!(
                "pre_filter_cap must be in 1..=255, got {}",
                self.pre_filter_cap
            )));
        }
        let max = self.min_disparity as i64 + self.num_disparities as i64;
        if max * DISP_SCALE as i64 > i16::MAX as i64 || (self.min_disparity as i64 - 1) * (DISP_SCALE as i64) < i16::MIN as i64 {
            return Err(StereoError::InvalidConfig(
                "disparity range does not fit the fixed-point output".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fixed-point disparities of the left rectified image.
///
/// A stored value `v` means a disparity of `v / scale` pixels; pixels without
/// a reliable match hold `invalid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisparityMap {
    pub width: u32,
    pub height: u32,
    pub data: Vec<i16>,
    pub scale: i16,
    pub invalid: i16,
}

impl DisparityMap {
    /// A map with every pixel invalid.
    pub fn new(width: u32, height: u32, min_disparity: i32) -> Self {
        let invalid = ((min_disparity - 1) * DISP_SCALE as i32) as i16;
        DisparityMap {
            width,
            height,
            data: vec![invalid; width as usize * height as usize],
            scale: DISP_SCALE,
            invalid,
        }
    }

    pub fn raw(&self, x: u32, y: u32) -> Option<i16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Disparity in pixels, `None` if outside the map or invalid.
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        self.raw(x, y)
            .filter(|&v| v != self.invalid)
            .map(|v| v as f32 / self.scale as f32)
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|&&v| v != self.invalid).count()
    }

    /// 8-bit visualization scaled to the valid range; invalid pixels are black.
    pub fn to_image(&self) -> GrayImage {
        let valid = self.data.iter().copied().filter(|&v| v != self.invalid);
        let (min, max) = valid.fold((i16::MAX, i16::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));
        let range = (max as f32 - min as f32).max(1.0);
        GrayImage::from_fn(self.width, self.height, |x, y| {
            let v = self.data[y as usize * self.width as usize + x as usize];
            if v == self.invalid {
                Luma([0])
            } else {
                Luma([(1.0 + 254.0 * (v - min) as f32 / range).round() as u8])
            }
        })
    }
}

/// Computes the disparity map of a rectified pair.
///
/// # Errors
///
/// * [`StereoError::SizeMismatch`] if the two images differ in size.
/// * [`StereoError::InvalidConfig`] for invalid parameters.
pub fn compute(left: &GrayImage, right: &GrayImage, params: &SgbmParams) -> Result<DisparityMap> {
    params.validate()?;
    if left.dimensions() != right.dimensions() {
        return Err(StereoError::SizeMismatch {
            expected: left.dimensions(),
            actual: right.dimensions(),
        });
    }
    Ok(sgbm::run(left, right, params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::value_noise;

    /// Textured pair where the right image is the left shifted by `shift` pixels.
    fn shifted_pair(width: u32, height: u32, shift: f64) -> (GrayImage, GrayImage) {
        let texture = |x: f64, y: f64| value_noise(x, y, 3.0, 11).round() as u8;
        let left = GrayImage::from_fn(width, height, |x, y| Luma([texture(x as f64, y as f64)]));
        let right =
            GrayImage::from_fn(width, height, |x, y| Luma([texture(x as f64 + shift, y as f64)]));
        (left, right)
    }

    #[test]
    fn test_default_params() {
        let params = SgbmParams::default();
        assert_eq!(params.num_disparities, 128);
        assert_eq!(params.block_size, 5);
        assert_eq!(params.p1, 600);
        assert_eq!(params.p2, 2400);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_params_validation() {
        let mut params = SgbmParams::with_block_size(0, 40, 5);
        assert!(params.validate().is_err());
        params.num_disparities = 48;
        params.block_size = 4;
        assert!(params.validate().is_err());
        params.block_size = 3;
        params.p2 = params.p1 - 1;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_constant_shift_is_recovered() {
        let (left, right) = shifted_pair(96, 48, 7.0);
        let params = SgbmParams::with_block_size(0, 16, 5);
        let map = compute(&left, &right, &params).unwrap();

        let mut good = 0;
        let mut valid = 0;
        for y in 0..48 {
            for x in 24..96 {
                if let Some(d) = map.get(x, y) {
                    valid += 1;
                    if (d - 7.0).abs() < 0.5 {
                        good += 1;
                    }
                }
            }
        }
        assert!(valid > 72 * 48 * 8 / 10, "only {} valid pixels", valid);
        assert!(good as f64 >= 0.95 * valid as f64);
    }

    #[test]
    fn test_fractional_shift_is_recovered() {
        let shift = 6.4;
        let (left, right) = shifted_pair(96, 48, shift);
        let params = SgbmParams::with_block_size(0, 16, 5);
        let map = compute(&left, &right, &params).unwrap();

        let mut errors = Vec::new();
        for y in 0..48 {
            for x in 24..96 {
                if let Some(d) = map.get(x, y) {
                    errors.push((d as f64 - shift).abs());
                }
            }
        }
        assert!(errors.len() > 72 * 48 * 8 / 10, "only {} valid pixels", errors.len());
        let mean = errors.iter().sum::<f64>() / errors.len() as f64;
        let good = errors.iter().filter(|&&e| e < 0.5).count();
        assert!(mean < 0.25, "mean error {}", mean);
        assert!(good as f64 >= 0.95 * errors.len() as f64);
    }

    #[test]
    fn test_compute_is_deterministic() {
        let (left, right) = shifted_pair(64, 32, 4.5);
        let params = SgbmParams {
            paths: PathMode::Four,
            ..SgbmParams::with_block_size(0, 16, 3)
        };
        let first = compute(&left, &right, &params).unwrap();
        let second = compute(&left, &right, &params).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_flat_images_are_invalid() {
        let flat = GrayImage::from_pixel(48, 24, Luma([100]));
        let map = compute(&flat, &flat, &SgbmParams::with_block_size(0, 16, 5)).unwrap();
        assert_eq!(map.valid_count(), 0);
    }

    #[test]
    fn test_size_mismatch() {
        let a = GrayImage::new(32, 16);
        let b = GrayImage::new(32, 17);
        assert!(matches!(
            compute(&a, &b, &SgbmParams::with_block_size(0, 16, 3)),
            Err(StereoError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_map_accessors() {
        let mut map = DisparityMap::new(4, 2, 0);
        assert_eq!(map.invalid, -16);
        map.data[5] = 40;
        assert_eq!(map.get(1, 1), Some(2.5));
        assert_eq!(map.get(0, 0), None);
        assert_eq!(map.get(4, 0), None);
        assert_eq!(map.valid_count(), 1);
        assert_eq!(map.to_image().get_pixel(1, 1)[0], 1);
    }
}
