//! Deterministic synthetic stereo rigs, observations and rendered images.
//!
//! Everything here is reproducible across runs and platforms: pixel noise and
//! plane textures come from a SplitMix64 hash of integer keys rather than a
//! stateful random generator.

use crate::camera::{Intrinsics, RadTanModel, Resolution};
use crate::geometry::{essential_matrix, fundamental_matrix, rodrigues, Pose};
use crate::optimization::StereoExtrinsics;
use crate::pattern::{CalibrationPattern, CornerObservation, StereoObservationPair};
use image::GrayImage;
use nalgebra::{Matrix3, Vector2, Vector3};
use rayon::prelude::*;

const BOARD_DARK: f64 = 30.0;
const BOARD_LIGHT: f64 = 225.0;
const BACKGROUND: f64 = 128.0;

/// Two distorted cameras, about 6 cm apart, looking at the same scene.
#[derive(Debug, Clone)]
pub struct SyntheticRig {
    pub resolution: Resolution,
    pub left: RadTanModel,
    pub right: RadTanModel,
    pub extrinsics: StereoExtrinsics,
}

impl Default for SyntheticRig {
    fn default() -> Self {
        let resolution = Resolution::new(320, 240);
        let left = RadTanModel::from_parts(
            Intrinsics {
                fx: 300.0,
                fy: 302.0,
                cx: 161.5,
                cy: 119.0,
            },
            resolution,
            [-0.05, 0.01, 0.0005, -0.0003, 0.0],
        );
        let right = RadTanModel::from_parts(
            Intrinsics {
                fx: 298.0,
                fy: 300.0,
                cx: 158.0,
                cy: 121.5,
            },
            resolution,
            [-0.04, 0.008, -0.0004, 0.0002, 0.0],
        );
        SyntheticRig::new(
            resolution,
            left,
            right,
            rodrigues(&Vector3::new(0.005, -0.01, 0.003)),
            Vector3::new(-0.06, 0.0008, 0.0005),
        )
    }
}

impl SyntheticRig {
    pub fn new(
        resolution: Resolution,
        left: RadTanModel,
        right: RadTanModel,
        rotation: Matrix3<f64>,
        translation: Vector3<f64>,
    ) -> Self {
        let essential = essential_matrix(&rotation, &translation);
        let fundamental =
            fundamental_matrix(&left.camera_matrix(), &right.camera_matrix(), &essential)
                .unwrap_or_else(Matrix3::zeros);
        SyntheticRig {
            resolution,
            left,
            right,
            extrinsics: StereoExtrinsics {
                rotation,
                translation,
                essential,
                fundamental,
            },
        }
    }

    /// Left-to-right camera transform.
    pub fn relative_pose(&self) -> Pose {
        Pose::new(self.extrinsics.rotation, self.extrinsics.translation)
    }

    /// Fifteen tilted pattern-to-left-camera poses; every 9x6 board, quiet
    /// zone included, stays inside both images.
    pub fn left_board_poses(&self) -> Vec<Pose> {
        board_poses(&CalibrationPattern::default(), 15)
    }
}

/// Horizontal viewing directions (tangent of the angle) swept by the board centers.
const BOARD_COLUMNS: [f64; 5] = [0.0, -0.14, 0.14, -0.07, 0.07];
/// Vertical viewing directions swept by the board centers.
const BOARD_ROWS: [f64; 3] = [0.0, -0.10, 0.10];
/// Shifts the sweep toward the right camera so both images see the board.
const BOARD_COLUMN_OFFSET: f64 = 0.035;

/// Tilted board poses at 0.72 to 0.88 m.
///
/// The centers sweep a 5x3 grid of viewing directions so the corners reach
/// the image periphery of both cameras; the first pose is centered.
/// Distortion estimated from views that only cover the image center does
/// not extrapolate to the borders.
pub fn board_poses(pattern: &CalibrationPattern, count: usize) -> Vec<Pose> {
    let center = Vector3::new(
        0.5 * (pattern.cols - 1) as f64 * pattern.spacing,
        0.5 * (pattern.rows - 1) as f64 * pattern.spacing,
        0.0,
    );
    (0..count)
        .map(|i| {
            let a = i as f64;
            let rotation = rodrigues(&Vector3::new(
                0.3 * (a * 0.9).sin(),
                0.3 * (a * 1.7 + 0.5).cos(),
                0.1 * (a * 0.6).sin(),
            ));
            let u = BOARD_COLUMN_OFFSET + BOARD_COLUMNS[i % BOARD_COLUMNS.len()];
            let v = BOARD_ROWS[(i / BOARD_COLUMNS.len()) % BOARD_ROWS.len()];
            let depth = 0.8 + 0.08 * (a * 1.3).sin();
            let board_center = Vector3::new(u * depth, v * depth, depth);
            Pose::new(rotation, board_center - rotation * center)
        })
        .collect()
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn unit_f64(x: u64) -> f64 {
    (x >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
}

fn mix_key(seed: u64, a: u64, b: u64) -> u64 {
    seed ^ a.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ b.wrapping_mul(0xBF58_476D_1CE4_E5B9)
}

/// Uniform noise in `[-max_abs, max_abs]` per axis for a `(view, point)` key.
pub fn pixel_noise(seed: u64, view: usize, point: usize, max_abs: f64) -> Vector2<f64> {
    if max_abs == 0.0 {
        return Vector2::zeros();
    }
    let key = mix_key(seed, view as u64, point as u64);
    let u = unit_f64(splitmix64(key));
    let v = unit_f64(splitmix64(key ^ 0x94D0_49BB_1331_11EB));
    Vector2::new((u - 0.5) * 2.0 * max_abs, (v - 0.5) * 2.0 * max_abs)
}

/// Projects the pattern for every pose and perturbs the pixels.
///
/// Views with a point behind the camera are dropped.
pub fn observe_views(
    model: &RadTanModel,
    pattern: &CalibrationPattern,
    poses: &[Pose],
    noise: f64,
    seed: u64,
) -> Vec<CornerObservation> {
    let object_points = pattern.object_points();
    poses
        .iter()
        .enumerate()
        .filter_map(|(view, pose)| {
            object_points
                .iter()
                .enumerate()
                .map(|(index, point)| {
                    model
                        .project_unbounded(&pose.transform_point(point))
                        .map(|p| p + pixel_noise(seed, view, index, noise))
                })
                .collect::<Result<Vec<_>, _>>()
                .ok()
                .map(CornerObservation::new)
        })
        .collect()
}

/// Noisy stereo observations of the rig's board poses.
pub fn observe_pairs(
    rig: &SyntheticRig,
    pattern: &CalibrationPattern,
    noise: f64,
    seed: u64,
) -> Vec<StereoObservationPair> {
    let left_poses = board_poses(pattern, 15);
    let relative = rig.relative_pose();
    let right_poses: Vec<Pose> = left_poses.iter().map(|p| relative.compose(p)).collect();
    let lefts = observe_views(&rig.left, pattern, &left_poses, noise, seed);
    let rights = observe_views(&rig.right, pattern, &right_poses, noise, seed.wrapping_add(1));
    lefts
        .into_iter()
        .zip(rights)
        .filter_map(|(l, r)| StereoObservationPair::new(pattern, Some(l), Some(r)))
        .collect()
}

/// Renders a plane (the `Z = 0` plane of `pose`) through a distorted camera.
///
/// `shade` maps plane coordinates to an intensity, or `None` where the plane
/// is not painted. Every pixel averages `supersample x supersample` rays.
pub fn render_plane<F>(model: &RadTanModel, pose: &Pose, supersample: u32, shade: F) -> GrayImage
where
    F: Fn(f64, f64) -> Option<f64> + Sync,
{
    let width = model.resolution.width;
    let height = model.resolution.height;
    let normal = pose.rotation.column(2).into_owned();
    let offset = normal.dot(&pose.translation);
    let rotation_t = pose.rotation.transpose();
    let n = supersample.max(1);

    let mut buffer = vec![0u8; width as usize * height as usize];
    buffer
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, pixel) in row.iter_mut().enumerate() {
                let mut sum = 0.0;
                for sy in 0..n {
                    for sx in 0..n {
                        let u = x as f64 + (sx as f64 + 0.5) / n as f64 - 0.5;
                        let v = y as f64 + (sy as f64 + 0.5) / n as f64 - 0.5;
                        let value = model
                            .pixel_to_normalized(&Vector2::new(u, v))
                            .ok()
                            .and_then(|ray| {
                                let dir = Vector3::new(ray.x, ray.y, 1.0);
                                let denom = normal.dot(&dir);
                                if denom.abs() < 1e-12 {
                                    return None;
                                }
                                let s = offset / denom;
                                if s <= 0.0 {
                                    return None;
                                }
                                let on_plane = rotation_t * (dir * s - pose.translation);
                                shade(on_plane.x, on_plane.y)
                            })
                            .unwrap_or(BACKGROUND);
                        sum += value;
                    }
                }
                *pixel = (sum / (n * n) as f64).round().clamp(0.0, 255.0) as u8;
            }
        });

    GrayImage::from_raw(width, height, buffer).unwrap_or_else(|| GrayImage::new(width, height))
}

/// Chessboard intensity with a two-square white margin around the corner grid.
pub fn chessboard_shade(pattern: &CalibrationPattern, x: f64, y: f64) -> Option<f64> {
    let s = pattern.spacing;
    let (cols, rows) = (pattern.cols as f64, pattern.rows as f64);
    let in_squares = x >= -s && x < cols * s && y >= -s && y < rows * s;
    if in_squares {
        let parity = ((x / s).floor() as i64 + (y / s).floor() as i64).rem_euclid(2);
        return Some(if parity == 0 { BOARD_DARK } else { BOARD_LIGHT });
    }
    let in_margin = x >= -2.0 * s && x < (cols + 1.0) * s && y >= -2.0 * s && y < (rows + 1.0) * s;
    in_margin.then_some(BOARD_LIGHT)
}

/// Renders the pattern seen by `model` from `pose` (pattern to camera).
pub fn render_chessboard(model: &RadTanModel, pattern: &CalibrationPattern, pose: &Pose) -> GrayImage {
    render_plane(model, pose, 4, |x, y| chessboard_shade(pattern, x, y))
}

/// Bilinearly interpolated value noise with the given cell size, in `[0, 255]`.
pub fn value_noise(x: f64, y: f64, cell: f64, seed: u64) -> f64 {
    let gx = x / cell;
    let gy = y / cell;
    let (x0, y0) = (gx.floor(), gy.floor());
    let (fx, fy) = (gx - x0, gy - y0);
    let lattice = |i: f64, j: f64| {
        unit_f64(splitmix64(mix_key(seed, i as i64 as u64, j as i64 as u64))) * 255.0
    };
    let top = lattice(x0, y0) * (1.0 - fx) + lattice(x0 + 1.0, y0) * fx;
    let bottom = lattice(x0, y0 + 1.0) * (1.0 - fx) + lattice(x0 + 1.0, y0 + 1.0) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Left and right images of a textured plane parallel to the left sensor at `depth`.
pub fn render_plane_pair(rig: &SyntheticRig, depth: f64, seed: u64) -> (GrayImage, GrayImage) {
    let plane = Pose::new(Matrix3::identity(), Vector3::new(0.0, 0.0, depth));
    let in_right = rig.relative_pose().compose(&plane);
    let shade = |x: f64, y: f64| Some(value_noise(x, y, 0.007, seed));
    rayon::join(
        || render_plane(&rig.left, &plane, 3, shade),
        || render_plane(&rig.right, &in_right, 3, shade),
    )
}
