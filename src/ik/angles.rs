//! Angle utilities for constraint limit handling.

use std::f32::consts::{PI, TAU};

/// Wrap an angle into `(-PI, PI]`.
pub fn wrap_angle(angle: f32) -> f32 {
    let mut wrapped = angle.rem_euclid(TAU);
    if wrapped > PI {
        wrapped -= TAU;
    }
    wrapped
}

/// Wrap both limits into `(-PI, PI]` and swap them if inverted.
pub fn normalize_angle_limits(min_angle: f32, max_angle: f32) -> (f32, f32) {
    let min_angle = wrap_angle(min_angle);
    let max_angle = wrap_angle(max_angle);
    if min_angle > max_angle {
        (max_angle, min_angle)
    } else {
        (min_angle, max_angle)
    }
}

/// Clamp an out-of-range angle to `min_angle` or `max_angle`.
///
/// The invalid zone between the limits has a bisector; angles on the
/// max-side of it clamp to `max_angle`, the rest to `min_angle`.
///
/// ```text
///                max_angle
///                  \
///                   \
///                    (o)--------> 0
///                 .-'  \
///              .-'      \
/// invalid_bisector       min_angle
/// ```
pub fn clamp_angle(angle: f32, min_angle: f32, max_angle: f32) -> f32 {
    let invalid_bisector = max_angle + 0.5 * (TAU - (max_angle - min_angle));
    if (angle > max_angle && angle < invalid_bisector) || angle < invalid_bisector - TAU {
        max_angle
    } else {
        min_angle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::{FRAC_PI_2, FRAC_PI_4};

    #[test]
    fn wrap_angle_leaves_in_range_values_alone() {
        assert_relative_eq!(wrap_angle(1.0), 1.0);
        assert_relative_eq!(wrap_angle(-3.0), -3.0);
        assert_relative_eq!(wrap_angle(PI), PI);
    }

    #[test]
    fn wrap_angle_removes_full_turns() {
        assert_relative_eq!(wrap_angle(1.0 + TAU), 1.0, epsilon = 1.0e-5);
        assert_relative_eq!(wrap_angle(-1.0 - 2.0 * TAU), -1.0, epsilon = 1.0e-5);
    }

    #[test]
    fn wrap_angle_maps_negative_pi_to_positive() {
        assert_relative_eq!(wrap_angle(-PI), PI, epsilon = 1.0e-6);
    }

    #[test]
    fn normalize_angle_limits_swaps_inverted_limits() {
        let (min, max) = normalize_angle_limits(FRAC_PI_2, -FRAC_PI_2);
        assert_relative_eq!(min, -FRAC_PI_2);
        assert_relative_eq!(max, FRAC_PI_2);
    }

    #[test]
    fn normalize_angle_limits_wraps_before_ordering() {
        let (min, max) = normalize_angle_limits(-FRAC_PI_4 + TAU, FRAC_PI_2);
        assert_relative_eq!(min, -FRAC_PI_4, epsilon = 1.0e-5);
        assert_relative_eq!(max, FRAC_PI_2, epsilon = 1.0e-5);
    }

    #[test]
    fn clamp_angle_returns_only_limits() {
        let (min, max) = (-FRAC_PI_4, FRAC_PI_2);
        assert_relative_eq!(clamp_angle(FRAC_PI_2 + 0.1, min, max), max);
        assert_relative_eq!(clamp_angle(-FRAC_PI_4 - 0.1, min, max), min);
    }

    #[test]
    fn clamp_angle_selects_nearer_limit_across_the_gap() {
        let (min, max) = (-FRAC_PI_4, FRAC_PI_2);
        // bisector of the invalid zone sits at 9*PI/8, i.e. -7*PI/8 wrapped
        assert_relative_eq!(clamp_angle(3.0, min, max), max);
        assert_relative_eq!(clamp_angle(-3.0, min, max), max);
        assert_relative_eq!(clamp_angle(-1.5, min, max), min);
    }
}
