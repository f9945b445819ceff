use glam::{Quat, Vec3};
use std::f32::consts::PI;

const PARALLEL_DOT_LIMIT: f32 = 1.0 - 1.0e-6;

/// Shortest-arc rotation carrying `from` onto `to`.
///
/// Inputs need not be normalized. A near-zero vector yields the identity;
/// antiparallel vectors yield a half-turn about an arbitrary perpendicular
/// axis.
pub fn shortest_arc(from: Vec3, to: Vec3) -> Quat {
    let from = from.normalize_or_zero();
    let to = to.normalize_or_zero();
    if from == Vec3::ZERO || to == Vec3::ZERO {
        return Quat::IDENTITY;
    }
    let dot = from.dot(to);
    if dot > PARALLEL_DOT_LIMIT {
        return Quat::IDENTITY;
    }
    if dot < -PARALLEL_DOT_LIMIT {
        return Quat::from_axis_angle(from.any_orthonormal_vector(), PI);
    }
    Quat::from_rotation_arc(from, to)
}

/// True when `a` and `b` represent rotations within `tolerance` radians of
/// each other, regardless of quaternion sign.
///
/// Measured through the relative rotation's vector part, which stays
/// well-conditioned near identity where a dot-product comparison loses all
/// of its precision.
pub fn almost_equal(a: Quat, b: Quat, tolerance: f32) -> bool {
    let relative = a.conjugate() * b;
    let sin_half_angle = Vec3::new(relative.x, relative.y, relative.z).length();
    let cos_half_angle = relative.w.abs();
    2.0 * sin_half_angle.atan2(cos_half_angle) <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn shortest_arc_maps_from_onto_to() {
        let q = shortest_arc(Vec3::X, Vec3::Y);
        let rotated = q * Vec3::X;
        assert_relative_eq!(rotated.x, 0.0, epsilon = 1.0e-6);
        assert_relative_eq!(rotated.y, 1.0, epsilon = 1.0e-6);
        assert_relative_eq!(rotated.z, 0.0, epsilon = 1.0e-6);
    }

    #[test]
    fn shortest_arc_accepts_unnormalized_inputs() {
        let q = shortest_arc(Vec3::new(0.0, 3.0, 0.0), Vec3::new(0.0, 0.0, 0.25));
        let rotated = q * Vec3::Y;
        assert_relative_eq!(rotated.z, 1.0, epsilon = 1.0e-6);
    }

    #[test]
    fn shortest_arc_degenerate_input_is_identity() {
        assert_eq!(shortest_arc(Vec3::ZERO, Vec3::X), Quat::IDENTITY);
        assert_eq!(shortest_arc(Vec3::X, Vec3::X), Quat::IDENTITY);
    }

    #[test]
    fn shortest_arc_antiparallel_is_half_turn() {
        let q = shortest_arc(Vec3::X, Vec3::NEG_X);
        let rotated = q * Vec3::X;
        assert_relative_eq!(rotated.x, -1.0, epsilon = 1.0e-5);
        assert_relative_eq!(rotated.length(), 1.0, epsilon = 1.0e-5);
    }

    #[test]
    fn almost_equal_is_sign_insensitive() {
        let q = Quat::from_axis_angle(Vec3::Z, 1.0);
        assert!(almost_equal(q, q, 1.0e-5));
        assert!(almost_equal(q, -q, 1.0e-5));
        let other = Quat::from_axis_angle(Vec3::Z, 1.1);
        assert!(!almost_equal(q, other, 1.0e-3));
        assert!(almost_equal(q, other, 0.2));
    }
}
