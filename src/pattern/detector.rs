//! Chessboard inner-corner detection.
//!
//! Candidates are local maxima of the saddle response `Ixy^2 - Ixx * Iyy` on a
//! blurred copy of the image. A candidate survives when a circle around it
//! crosses exactly four light/dark boundaries with point-symmetric colors.
//! The survivors are ordered by fitting a homography from the pattern grid to
//! the four outermost corners and matching every grid node to its nearest
//! candidate, then refined to sub-pixel accuracy.

use super::subpix::{refine_corners, Raster};
use super::{CalibrationPattern, CornerObservation};
use crate::geometry::{apply_homography, homography_dlt};
use image::GrayImage;
use log::debug;
use nalgebra::{Matrix3, Vector2};
use serde::{Deserialize, Serialize};

const RING_SAMPLES: usize = 16;
const MAX_HULL_SIZE: usize = 64;
const MIN_ORIENTATION_SCORE: f64 = 0.3;
/// Required lead of the chosen labeling over the next one; square grids
/// rotated near 45 degrees have two equally upright labelings.
const MIN_ORIENTATION_MARGIN: f64 = 0.3;
const NODE_TOLERANCE: f64 = 0.4;
const DUPLICATE_DISTANCE: f64 = 1.5;

/// Detector and refinement parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorParams {
    /// Gaussian sigma applied before the saddle response.
    pub blur_sigma: f64,
    /// Response threshold relative to the strongest response in the image.
    pub response_threshold: f64,
    /// Non-maximum suppression radius, in pixels.
    pub nms_radius: usize,
    /// Radius of the circle used to verify a candidate. Must stay below half
    /// of the smallest square size in pixels.
    pub ring_radius: f64,
    /// Minimum intensity difference between the light and dark sectors.
    pub min_contrast: f64,
    /// Half size of the refinement window; 5 gives an 11x11 window.
    pub window_half_size: usize,
    pub max_iterations: usize,
    pub epsilon: f64,
}

impl Default for ExtractorParams {
    fn default() -> Self {
        ExtractorParams {
            blur_sigma: 1.5,
            response_threshold: 0.05,
            nms_radius: 3,
            ring_radius: 5.0,
            min_contrast: 20.0,
            window_half_size: 5,
            max_iterations: 30,
            epsilon: 0.001,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    point: Vector2<f64>,
    response: f32,
}

/// Locates the pattern's inner corners in `image`.
///
/// Returns `None` when the pattern is not fully visible, when the number of
/// verified corners differs from `rows * cols`, or when the grid orientation
/// cannot be decided. Square grids are only decided while their in-plane
/// rotation stays well below 45 degrees. Points come back in the pattern's
/// row-major order.
pub fn extract(
    image: &GrayImage,
    pattern: &CalibrationPattern,
    params: &ExtractorParams,
) -> Option<CornerObservation> {
    if pattern.validate().is_err() {
        return None;
    }
    let raster = Raster::from_gray(image);
    let blurred = raster.gaussian_blur(params.blur_sigma);

    let mut candidates = saddle_candidates(&blurred, params);
    candidates.retain(|c| passes_ring_test(&blurred, &c.point, params));
    debug!("{} saddle candidates passed the ring test", candidates.len());

    let mut points: Vec<Vector2<f64>> = candidates.iter().map(|c| c.point).collect();
    refine_corners(
        &raster,
        &mut points,
        params.window_half_size,
        params.max_iterations,
        params.epsilon,
    );
    for (candidate, point) in candidates.iter_mut().zip(points) {
        candidate.point = point;
    }
    let points = deduplicate(candidates);

    if points.len() != pattern.point_count() {
        debug!(
            "found {} corners, expected {}",
            points.len(),
            pattern.point_count()
        );
        return None;
    }

    let ordered = order_grid(&points, pattern)?;
    Some(CornerObservation::new(ordered))
}

fn saddle_candidates(blurred: &Raster, params: &ExtractorParams) -> Vec<Candidate> {
    let (w, h) = (blurred.width, blurred.height);
    let border = (params.ring_radius.ceil() as usize + 2).max(params.nms_radius + 1);
    if w <= 2 * border || h <= 2 * border {
        return Vec::new();
    }

    let mut response = vec![0.0f32; w * h];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let (xi, yi) = (x as isize, y as isize);
            let c = blurred.at(xi, yi);
            let ixx = blurred.at(xi + 1, yi) - 2.0 * c + blurred.at(xi - 1, yi);
            let iyy = blurred.at(xi, yi + 1) - 2.0 * c + blurred.at(xi, yi - 1);
            let ixy = 0.25
                * (blurred.at(xi + 1, yi + 1) - blurred.at(xi + 1, yi - 1)
                    - blurred.at(xi - 1, yi + 1)
                    + blurred.at(xi - 1, yi - 1));
            response[y * w + x] = (ixy * ixy - ixx * iyy).max(0.0);
        }
    }

    let max_response = response.iter().cloned().fold(0.0f32, f32::max);
    if max_response <= f32::EPSILON {
        return Vec::new();
    }
    let threshold = max_response * params.response_threshold as f32;
    let radius = params.nms_radius as isize;

    let mut candidates = Vec::new();
    for y in border..h - border {
        for x in border..w - border {
            let value = response[y * w + x];
            if value < threshold {
                continue;
            }
            let index = y * w + x;
            let mut is_max = true;
            'window: for dy in -radius..=radius {
                for dx in -radius..=radius {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let other = (y as isize + dy) as usize * w + (x as isize + dx) as usize;
                    let neighbour = response[other];
                    // ties go to the first pixel in raster order
                    if neighbour > value || (neighbour == value && other < index) {
                        is_max = false;
                        break 'window;
                    }
                }
            }
            if is_max {
                candidates.push(Candidate {
                    point: Vector2::new(x as f64, y as f64),
                    response: value,
                });
            }
        }
    }
    candidates
}

fn passes_ring_test(blurred: &Raster, center: &Vector2<f64>, params: &ExtractorParams) -> bool {
    let samples: Vec<f32> = (0..RING_SAMPLES)
        .map(|i| {
            let angle = 2.0 * std::f64::consts::PI * i as f64 / RING_SAMPLES as f64;
            blurred.sample(
                center.x + params.ring_radius * angle.cos(),
                center.y + params.ring_radius * angle.sin(),
            )
        })
        .collect();

    let min = samples.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = samples.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if ((max - min) as f64) < params.min_contrast {
        return false;
    }

    let mean = samples.iter().sum::<f32>() / RING_SAMPLES as f32;
    let bright: Vec<bool> = samples.iter().map(|&v| v > mean).collect();
    let transitions = (0..RING_SAMPLES)
        .filter(|&i| bright[i] != bright[(i + 1) % RING_SAMPLES])
        .count();
    if transitions != 4 {
        return false;
    }

    let symmetric = (0..RING_SAMPLES)
        .filter(|&i| bright[i] == bright[(i + RING_SAMPLES / 2) % RING_SAMPLES])
        .count();
    symmetric >= RING_SAMPLES * 3 / 4
}

/// Drops corners that converged onto the same saddle, keeping the stronger one.
fn deduplicate(mut candidates: Vec<Candidate>) -> Vec<Vector2<f64>> {
    candidates.sort_by(|a, b| b.response.total_cmp(&a.response));
    let mut kept: Vec<Vector2<f64>> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept
            .iter()
            .all(|p| (p - candidate.point).norm() > DUPLICATE_DISTANCE)
        {
            kept.push(candidate.point);
        }
    }
    kept
}

fn cross(o: &Vector2<f64>, a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Andrew's monotone chain; returns hull vertices counter-clockwise (in a
/// y-up frame) without collinear points.
fn convex_hull(points: &[Vector2<f64>]) -> Vec<Vector2<f64>> {
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    if sorted.len() < 3 {
        return sorted;
    }

    let mut hull: Vec<Vector2<f64>> = Vec::with_capacity(2 * sorted.len());
    for p in sorted.iter() {
        while hull.len() >= 2 && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(*p);
    }
    let lower_len = hull.len() + 1;
    for p in sorted.iter().rev().skip(1) {
        while hull.len() >= lower_len
            && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0.0
        {
            hull.pop();
        }
        hull.push(*p);
    }
    hull.pop();
    hull
}

fn quad_area(q: &[Vector2<f64>; 4]) -> f64 {
    let mut area = 0.0;
    for i in 0..4 {
        let a = q[i];
        let b = q[(i + 1) % 4];
        area += a.x * b.y - b.x * a.y;
    }
    0.5 * area.abs()
}

/// Largest-area quadrilateral with vertices on the hull, in hull order.
fn outer_quad(hull: &[Vector2<f64>]) -> Option<[Vector2<f64>; 4]> {
    let n = hull.len();
    if n < 4 || n > MAX_HULL_SIZE {
        return None;
    }
    let mut best: Option<([Vector2<f64>; 4], f64)> = None;
    for i in 0..n {
        for j in i + 1..n {
            for k in j + 1..n {
                for l in k + 1..n {
                    let quad = [hull[i], hull[j], hull[k], hull[l]];
                    let area = quad_area(&quad);
                    if best.as_ref().map_or(true, |(_, a)| area > *a) {
                        best = Some((quad, area));
                    }
                }
            }
        }
    }
    best.map(|(quad, _)| quad)
}

/// Matches every grid node predicted by `h` to a distinct detected point.
fn match_nodes(
    h: &Matrix3<f64>,
    points: &[Vector2<f64>],
    pattern: &CalibrationPattern,
) -> Option<Vec<Vector2<f64>>> {
    let mut used = vec![false; points.len()];
    let mut ordered = Vec::with_capacity(pattern.point_count());
    for r in 0..pattern.rows {
        for c in 0..pattern.cols {
            let (cf, rf) = (c as f64, r as f64);
            let predicted = apply_homography(h, &Vector2::new(cf, rf));
            let step_c = (apply_homography(h, &Vector2::new(cf + 1.0, rf)) - predicted).norm();
            let step_r = (apply_homography(h, &Vector2::new(cf, rf + 1.0)) - predicted).norm();
            let tolerance = NODE_TOLERANCE * step_c.min(step_r);
            if !tolerance.is_finite() {
                return None;
            }

            let (index, distance) = points
                .iter()
                .enumerate()
                .map(|(i, p)| (i, (p - predicted).norm()))
                .min_by(|a, b| a.1.total_cmp(&b.1))?;
            if distance > tolerance || used[index] {
                return None;
            }
            used[index] = true;
            ordered.push(points[index]);
        }
    }
    Some(ordered)
}

/// Puts `points` into row-major pattern order.
fn order_grid(points: &[Vector2<f64>], pattern: &CalibrationPattern) -> Option<Vec<Vector2<f64>>> {
    let hull = convex_hull(points);
    let quad = outer_quad(&hull)?;

    let last_c = (pattern.cols - 1) as f64;
    let last_r = (pattern.rows - 1) as f64;
    let grid_corners = [
        Vector2::new(0.0, 0.0),
        Vector2::new(last_c, 0.0),
        Vector2::new(last_c, last_r),
        Vector2::new(0.0, last_r),
    ];

    let mut best: Option<(Vec<Vector2<f64>>, f64)> = None;
    let mut runner_up = f64::NEG_INFINITY;
    for start in 0..4 {
        for reversed in [false, true] {
            let image_corners: Vec<Vector2<f64>> = (0..4)
                .map(|i| {
                    let offset = if reversed { 4 - i } else { i };
                    quad[(start + offset) % 4]
                })
                .collect();
            let Some(h) = homography_dlt(&grid_corners, &image_corners) else {
                continue;
            };
            let Some(ordered) = match_nodes(&h, points, pattern) else {
                continue;
            };

            let col_dir = (ordered[pattern.cols - 1] - ordered[0]).normalize();
            let row_dir = (ordered[(pattern.rows - 1) * pattern.cols] - ordered[0]).normalize();
            // mirrored labelings are impossible for a board seen from the front
            if col_dir.x * row_dir.y - col_dir.y * row_dir.x <= 0.0 {
                continue;
            }
            let score = col_dir.x + row_dir.y;
            let top = best.as_ref().map(|(_, s)| *s);
            match top {
                Some(top) if score <= top => runner_up = runner_up.max(score),
                _ => {
                    if let Some(top) = top {
                        runner_up = runner_up.max(top);
                    }
                    best = Some((ordered, score));
                }
            }
        }
    }

    match best {
        Some((ordered, score))
            if score >= MIN_ORIENTATION_SCORE && score - runner_up >= MIN_ORIENTATION_MARGIN =>
        {
            Some(ordered)
        }
        Some((_, score)) => {
            debug!(
                "grid orientation is ambiguous (score {:.3}, next {:.3})",
                score, runner_up
            );
            None
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraModel, Intrinsics, RadTanModel, Resolution};
    use crate::geometry::{rodrigues, Pose};
    use crate::synthetic::{self, SyntheticRig};
    use image::Luma;
    use nalgebra::Vector3;

    fn projected(model: &RadTanModel, pattern: &CalibrationPattern, pose: &Pose) -> Vec<Vector2<f64>> {
        pattern
            .object_points()
            .iter()
            .map(|p| model.project(&pose.transform_point(p)).unwrap())
            .collect()
    }

    #[test]
    fn test_extract_rendered_boards() {
        let rig = SyntheticRig::default();
        let pattern = CalibrationPattern::default();
        let poses = synthetic::board_poses(&pattern, 15);
        let params = ExtractorParams::default();

        for (i, pose) in poses.iter().enumerate().step_by(4) {
            let image = synthetic::render_chessboard(&rig.left, &pattern, pose);
            let observation = extract(&image, &pattern, &params)
                .unwrap_or_else(|| panic!("board {} not found", i));
            let truth = projected(&rig.left, &pattern, pose);
            assert_eq!(observation.len(), 54);

            let errors: Vec<f64> = observation
                .points
                .iter()
                .zip(truth.iter())
                .map(|(a, b)| (a - b).norm())
                .collect();
            let mean = errors.iter().sum::<f64>() / errors.len() as f64;
            let max = errors.iter().cloned().fold(0.0, f64::max);
            assert!(mean < 0.15, "board {}: mean error {}", i, mean);
            assert!(max < 0.5, "board {}: max error {}", i, max);
        }
    }

    #[test]
    fn test_extract_rotated_board_keeps_row_major_order() {
        let model = RadTanModel::pinhole(
            Intrinsics {
                fx: 300.0,
                fy: 300.0,
                cx: 160.0,
                cy: 120.0,
            },
            Resolution::new(320, 240),
        );
        let pattern = CalibrationPattern::new(4, 5, 0.04).unwrap();
        let center = Vector3::new(0.08, 0.06, 0.0);
        let rotation = rodrigues(&Vector3::new(0.0, 0.0, 0.4));
        let pose = Pose::new(rotation, Vector3::new(0.0, 0.0, 0.6) - rotation * center);

        let image = synthetic::render_chessboard(&model, &pattern, &pose);
        let observation = extract(&image, &pattern, &ExtractorParams::default()).unwrap();
        let truth = projected(&model, &pattern, &pose);
        for (a, b) in observation.points.iter().zip(truth.iter()) {
            assert!((a - b).norm() < 0.5);
        }
    }

    fn square_board_view(pattern: &CalibrationPattern, angle: f64) -> (RadTanModel, Pose) {
        let model = RadTanModel::pinhole(
            Intrinsics {
                fx: 300.0,
                fy: 300.0,
                cx: 160.0,
                cy: 120.0,
            },
            Resolution::new(320, 240),
        );
        let center = Vector3::new(
            0.5 * (pattern.cols - 1) as f64 * pattern.spacing,
            0.5 * (pattern.rows - 1) as f64 * pattern.spacing,
            0.0,
        );
        let rotation = rodrigues(&Vector3::new(0.0, 0.0, angle));
        let pose = Pose::new(rotation, Vector3::new(0.0, 0.0, 0.7) - rotation * center);
        (model, pose)
    }

    #[test]
    fn test_extract_square_board() {
        let pattern = CalibrationPattern::new(5, 5, 0.04).unwrap();
        let (model, pose) = square_board_view(&pattern, 0.3);
        let image = synthetic::render_chessboard(&model, &pattern, &pose);
        let observation = extract(&image, &pattern, &ExtractorParams::default()).unwrap();
        let truth = projected(&model, &pattern, &pose);
        assert_eq!(observation.len(), 25);
        for (a, b) in observation.points.iter().zip(truth.iter()) {
            assert!((a - b).norm() < 0.5);
        }
    }

    #[test]
    fn test_square_board_at_45_degrees_is_ambiguous() {
        let angle = std::f64::consts::FRAC_PI_4;
        let square = CalibrationPattern::new(5, 5, 0.04).unwrap();
        let (model, pose) = square_board_view(&square, angle);
        let image = synthetic::render_chessboard(&model, &square, &pose);
        assert!(extract(&image, &square, &ExtractorParams::default()).is_none());

        // the same tilt is fine when rows and cols differ
        let board = CalibrationPattern::new(4, 5, 0.04).unwrap();
        let (model, pose) = square_board_view(&board, angle);
        let image = synthetic::render_chessboard(&model, &board, &pose);
        let observation = extract(&image, &board, &ExtractorParams::default()).unwrap();
        let truth = projected(&model, &board, &pose);
        for (a, b) in observation.points.iter().zip(truth.iter()) {
            assert!((a - b).norm() < 0.5);
        }
    }

    #[test]
    fn test_blank_image_has_no_pattern() {
        let image = GrayImage::from_pixel(320, 240, Luma([128]));
        assert!(extract(&image, &CalibrationPattern::default(), &ExtractorParams::default()).is_none());
    }

    #[test]
    fn test_wrong_pattern_size_is_rejected() {
        let rig = SyntheticRig::default();
        let pattern = CalibrationPattern::default();
        let pose = synthetic::board_poses(&pattern, 1)[0];
        let image = synthetic::render_chessboard(&rig.left, &pattern, &pose);
        let other = CalibrationPattern::new(5, 9, 0.04).unwrap();
        assert!(extract(&image, &other, &ExtractorParams::default()).is_none());
    }

    #[test]
    fn test_convex_hull_drops_interior_points() {
        let points = vec![
            Vector2::new(0.0, 0.0),
            Vector2::new(2.0, 0.0),
            Vector2::new(1.0, 1.0),
            Vector2::new(2.0, 2.0),
            Vector2::new(0.0, 2.0),
            Vector2::new(1.0, 0.0),
        ];
        let hull = convex_hull(&points);
        assert_eq!(hull.len(), 4);
        assert!(!hull.contains(&Vector2::new(1.0, 1.0)));
        assert!((quad_area(&[hull[0], hull[1], hull[2], hull[3]]) - 4.0).abs() < 1e-12);
    }
}
