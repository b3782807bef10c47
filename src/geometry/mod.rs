//! Projective and rigid-body geometry helpers.
//!
//! Rotations are kept as plain `Matrix3<f64>` values so they can be written to
//! the calibration artifact unchanged; [`project_to_so3`] is the single place
//! where numerical drift is removed.

use nalgebra::{DMatrix, Matrix3, Rotation3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Rigid transform `x_cam = rotation * x_world + translation`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Pose {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Pose::new(Matrix3::identity(), Vector3::zeros())
    }

    /// Builds a pose from an axis-angle vector and a translation.
    pub fn from_rvec(rvec: &Vector3<f64>, translation: Vector3<f64>) -> Self {
        Pose::new(rodrigues(rvec), translation)
    }

    pub fn rvec(&self) -> Vector3<f64> {
        rotation_log(&self.rotation)
    }

    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    /// `self * other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &Pose) -> Pose {
        Pose::new(
            self.rotation * other.rotation,
            self.rotation * other.translation + self.translation,
        )
    }

    pub fn inverse(&self) -> Pose {
        let rt = self.rotation.transpose();
        Pose::new(rt, -(rt * self.translation))
    }
}

/// Cross-product matrix `[v]x`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Exponential map from an axis-angle vector to a rotation matrix.
pub fn rodrigues(rvec: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::new(*rvec).into_inner()
}

/// Logarithm map of a rotation matrix to an axis-angle vector.
pub fn rotation_log(rotation: &Matrix3<f64>) -> Vector3<f64> {
    Rotation3::from_matrix_unchecked(project_to_so3(rotation)).scaled_axis()
}

/// Nearest rotation matrix in the Frobenius sense (polar decomposition via SVD).
///
/// A reflection (`det = -1`) is turned into a proper rotation by flipping the
/// singular vector belonging to the smallest singular value.
pub fn project_to_so3(m: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = m.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Matrix3::identity();
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let weakest = svd.singular_values.imin();
        let mut u_fixed = u;
        u_fixed.column_mut(weakest).neg_mut();
        r = u_fixed * v_t;
    }
    r
}

/// Hartley normalization: zero centroid and mean distance `sqrt(2)`.
///
/// Returns the normalized points and the similarity `T` with `p_n = T p`, or
/// `None` when all points coincide.
pub fn normalize_points(points: &[Vector2<f64>]) -> Option<(Vec<Vector2<f64>>, Matrix3<f64>)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if mean_dist <= f64::EPSILON {
        return None;
    }
    let scale = std::f64::consts::SQRT_2 / mean_dist;
    let t = Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    );
    let normalized = points.iter().map(|p| (p - centroid) * scale).collect();
    Some((normalized, t))
}

/// Normalized DLT homography with `dst ~ H src`, scaled so that `H[2,2] = 1`.
///
/// Returns `None` for fewer than four correspondences or a degenerate
/// configuration.
pub fn homography_dlt(src: &[Vector2<f64>], dst: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = src.len();
    if n < 4 || dst.len() != n {
        return None;
    }
    let (src_n, t_src) = normalize_points(src)?;
    let (dst_n, t_dst) = normalize_points(dst)?;

    // pad to a square system so the thin SVD keeps the null vector
    let mut a = DMatrix::<f64>::zeros((2 * n).max(9), 9);
    for (i, (s, d)) in src_n.iter().zip(dst_n.iter()).enumerate() {
        let (x, y, u, v) = (s.x, s.y, d.x, d.y);
        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;
        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h_vec = v_t.row(min_idx);
    let h_n = Matrix3::from_fn(|r, c| h_vec[3 * r + c]);

    let mut h = t_dst.try_inverse()? * h_n * t_src;
    let scale = h[(2, 2)];
    if scale.abs() <= f64::EPSILON || !h.iter().all(|v| v.is_finite()) {
        return None;
    }
    h /= scale;
    Some(h)
}

/// Applies a homography to a 2D point.
pub fn apply_homography(h: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    Vector2::new(q.x / q.z, q.y / q.z)
}

/// Recovers the pose of a `Z = 0` plane from its plane-to-image homography.
///
/// `h` must map metric plane coordinates to pixels of a camera with matrix
/// `k`. The recovered rotation is projected onto SO(3) and the sign is chosen
/// so the plane lies in front of the camera.
pub fn pose_from_homography(k: &Matrix3<f64>, h: &Matrix3<f64>) -> Option<Pose> {
    let k_inv = k.try_inverse()?;
    let m = k_inv * h;
    let h1 = m.column(0).into_owned();
    let h2 = m.column(1).into_owned();
    let h3 = m.column(2).into_owned();

    let norm = 0.5 * (h1.norm() + h2.norm());
    if norm <= f64::EPSILON {
        return None;
    }
    let mut lambda = 1.0 / norm;
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let rotation = project_to_so3(&Matrix3::from_columns(&[r1, r2, r3]));
    Some(Pose::new(rotation, h3 * lambda))
}

/// Essential matrix `E = [T]x R`.
pub fn essential_matrix(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix3<f64> {
    skew(translation) * rotation
}

/// Fundamental matrix `F = K2^-T E K1^-1`, scaled so that `F[2,2] = 1` when possible.
pub fn fundamental_matrix(
    k1: &Matrix3<f64>,
    k2: &Matrix3<f64>,
    essential: &Matrix3<f64>,
) -> Option<Matrix3<f64>> {
    let k1_inv = k1.try_inverse()?;
    let k2_inv = k2.try_inverse()?;
    let mut f = k2_inv.transpose() * essential * k1_inv;
    let scale = f[(2, 2)];
    if scale.abs() > f64::EPSILON {
        f /= scale;
    }
    Some(f)
}

/// Ratio of the largest to the smallest singular value; infinite when singular.
pub fn condition_number(m: &DMatrix<f64>) -> f64 {
    let singular_values = m.clone().svd(false, false).singular_values;
    let max = singular_values.iter().cloned().fold(0.0, f64::max);
    let min = singular_values.iter().cloned().fold(f64::INFINITY, f64::min);
    if min <= 0.0 || !min.is_finite() {
        f64::INFINITY
    } else {
        max / min
    }
}
