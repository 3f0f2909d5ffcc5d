//! Small fixed-size numeric kernels backing the navigation filter.
//!
//! This module collects the quaternion operations the error-state filter is
//! built on: the exponential and logarithmic maps between rotation vectors
//! and unit quaternions, vector rotation, the shortest-arc quaternion
//! between two directions, and incremental renormalization. Everything here
//! operates on `nalgebra` fixed-size types and performs no allocation.
//!
//! Quaternions are kept as raw [`Quaternion`] values rather than
//! [`nalgebra::UnitQuaternion`] because the filter manages normalization
//! itself: the exponential map produces an exactly-unit quaternion, and
//! measurement updates renormalize incrementally. Wrapping every product in
//! a unit type would hide the very norm drift the filter's invariant checks
//! watch for.

use nalgebra::{Matrix3, Quaternion, Vector3};

/// Largest tolerated deviation of the orientation quaternion's norm from
/// unity before the filter declares itself corrupted.
pub fn quaternion_norm_tolerance() -> f64 {
    (1000.0 * f32::EPSILON as f64).sqrt()
}

/// Exponential map: rotation vector (radians) to unit quaternion.
///
/// For a rotation vector `v = angle * axis`, returns the quaternion
/// `(cos(angle/2), sin(angle/2) * axis)`. Small angles use the series
/// expansion of `sin(angle/2)/angle` so the axis never has to be
/// normalized.
pub fn rotation_vector_to_quaternion(v: &Vector3<f64>) -> Quaternion<f64> {
    let angle = v.norm();
    let half = 0.5 * angle;
    // sin(angle/2)/angle, series-expanded below the precision knee
    let k = if angle > 1e-8 {
        half.sin() / angle
    } else {
        0.5 - angle * angle / 48.0
    };
    Quaternion::from_parts(half.cos(), v * k)
}

/// Logarithmic map: unit quaternion to rotation vector (radians).
///
/// Inverse of [`rotation_vector_to_quaternion`] on the hemisphere
/// `w >= 0`; a quaternion with negative scalar part maps to the
/// equivalent long-way rotation. Callers that need the covariance-side
/// branch must force co-hemisphere first (see
/// [`crate::NavState::sigma_point_difference`]).
pub fn quaternion_to_rotation_vector(q: &Quaternion<f64>) -> Vector3<f64> {
    let vec = q.vector().into_owned();
    let vec_norm = vec.norm();
    if vec_norm < 1e-12 {
        // Identity up to round-off; first-order inverse of the exp map.
        return vec * 2.0;
    }
    let angle = 2.0 * vec_norm.atan2(q.scalar());
    vec * (angle / vec_norm)
}

/// Rotate a vector by a unit quaternion (`q * v * q⁻¹`).
pub fn rotate_vector(q: &Quaternion<f64>, v: &Vector3<f64>) -> Vector3<f64> {
    let t = 2.0 * q.vector().cross(v);
    v + q.scalar() * t + q.vector().cross(&t)
}

/// Rotation matrix equivalent of a unit quaternion.
pub fn rotation_matrix(q: &Quaternion<f64>) -> Matrix3<f64> {
    let w = q.scalar();
    let (x, y, z) = (q.vector()[0], q.vector()[1], q.vector()[2]);
    Matrix3::new(
        1.0 - 2.0 * (y * y + z * z),
        2.0 * (x * y - w * z),
        2.0 * (x * z + w * y),
        2.0 * (x * y + w * z),
        1.0 - 2.0 * (x * x + z * z),
        2.0 * (y * z - w * x),
        2.0 * (x * z - w * y),
        2.0 * (y * z + w * x),
        1.0 - 2.0 * (x * x + y * y),
    )
}

/// Shortest-arc unit quaternion rotating direction `from` onto direction
/// `to`. Both inputs must be unit vectors. Antiparallel inputs rotate by
/// half a turn about an arbitrary axis normal to `from`.
pub fn quaternion_from_two_vectors(from: &Vector3<f64>, to: &Vector3<f64>) -> Quaternion<f64> {
    let dot = from.dot(to);
    if dot < -1.0 + 1e-9 {
        // Antiparallel: any axis in the plane normal to `from` works.
        let axis = match from.cross(&Vector3::x()).try_normalize(1e-9) {
            Some(axis) => axis,
            None => from.cross(&Vector3::y()).normalize(),
        };
        return Quaternion::from_parts(0.0, axis);
    }
    let q = Quaternion::from_parts(1.0 + dot, from.cross(to));
    incremental_normalize(&q)
}

/// Angle in radians between the rotations represented by two quaternions.
pub fn angular_distance(a: &Quaternion<f64>, b: &Quaternion<f64>) -> f64 {
    let relative = a.conjugate() * b;
    2.0 * relative.vector().norm().atan2(relative.scalar().abs())
}

/// Renormalize a near-unit quaternion by dividing out its current norm.
///
/// The norm of a quaternion built from unit-quaternion products deviates
/// from one only at second order in the accumulated perturbations, so a
/// single division restores it without reconstructing the rotation from
/// scratch.
pub fn incremental_normalize(q: &Quaternion<f64>) -> Quaternion<f64> {
    let n = q.norm();
    Quaternion::from_parts(q.scalar() / n, q.vector() / n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn exp_log_round_trip() {
        let v = Vector3::new(0.3, -0.2, 0.5);
        let q = rotation_vector_to_quaternion(&v);
        assert_approx_eq!(q.norm(), 1.0, 1e-12);
        let back = quaternion_to_rotation_vector(&q);
        assert_approx_eq!(back[0], v[0], 1e-12);
        assert_approx_eq!(back[1], v[1], 1e-12);
        assert_approx_eq!(back[2], v[2], 1e-12);
    }

    #[test]
    fn exp_of_small_rotation() {
        let v = Vector3::new(1e-12, 0.0, 0.0);
        let q = rotation_vector_to_quaternion(&v);
        assert_approx_eq!(q.norm(), 1.0, 1e-12);
        let back = quaternion_to_rotation_vector(&q);
        assert_approx_eq!(back[0], 1e-12, 1e-18);
    }

    #[test]
    fn rotate_matches_rotation_matrix() {
        let q = rotation_vector_to_quaternion(&Vector3::new(0.1, 0.7, -0.4));
        let v = Vector3::new(1.0, 2.0, 3.0);
        let by_quat = rotate_vector(&q, &v);
        let by_matrix = rotation_matrix(&q) * v;
        assert_approx_eq!(by_quat[0], by_matrix[0], 1e-12);
        assert_approx_eq!(by_quat[1], by_matrix[1], 1e-12);
        assert_approx_eq!(by_quat[2], by_matrix[2], 1e-12);
    }

    #[test]
    fn quarter_turn_about_z() {
        let q = rotation_vector_to_quaternion(&Vector3::new(0.0, 0.0, FRAC_PI_2));
        let rotated = rotate_vector(&q, &Vector3::x());
        assert_approx_eq!(rotated[0], 0.0, 1e-12);
        assert_approx_eq!(rotated[1], 1.0, 1e-12);
        assert_approx_eq!(rotated[2], 0.0, 1e-12);
    }

    #[test]
    fn two_vector_alignment() {
        let from = Vector3::x();
        let to = Vector3::new(0.0, 1.0, 0.0);
        let q = quaternion_from_two_vectors(&from, &to);
        let rotated = rotate_vector(&q, &from);
        assert_approx_eq!(rotated[0], to[0], 1e-12);
        assert_approx_eq!(rotated[1], to[1], 1e-12);
        assert_approx_eq!(rotated[2], to[2], 1e-12);
    }

    #[test]
    fn two_vector_alignment_antiparallel() {
        let from = Vector3::z();
        let to = -Vector3::z();
        let q = quaternion_from_two_vectors(&from, &to);
        assert_approx_eq!(q.norm(), 1.0, 1e-9);
        let rotated = rotate_vector(&q, &from);
        assert_approx_eq!(rotated[2], -1.0, 1e-9);
    }

    #[test]
    fn angular_distance_is_hemisphere_blind() {
        let a = Quaternion::new(1.0, 0.0, 0.0, 0.0);
        let b = Quaternion::new(-1.0, 0.0, 0.0, 0.0);
        assert_approx_eq!(angular_distance(&a, &b), 0.0, 1e-12);
        let c = rotation_vector_to_quaternion(&Vector3::new(0.0, 0.0, PI / 3.0));
        assert_approx_eq!(angular_distance(&a, &c), PI / 3.0, 1e-12);
    }

    #[test]
    fn incremental_normalize_restores_unit_norm() {
        let q = Quaternion::new(1.0 + 1e-4, 1e-3, -2e-3, 5e-4);
        let n = incremental_normalize(&q);
        assert_approx_eq!(n.norm(), 1.0, 1e-12);
    }
}
