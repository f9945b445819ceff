//! Rotational constraints limiting a joint's parent-local orientation.
//!
//! All six geometries share the swing/twist decomposition idiom: swing is
//! the minimal rotation carrying the constraint's forward axis onto its
//! rotated image, twist is the remaining rotation about that axis.
//! Constraints are immutable once built and shared between joints through
//! [`ConstraintFactory`].

use glam::{Quat, Vec3};
use std::collections::HashMap;
use std::f32::consts::FRAC_PI_2;
use std::sync::Arc;

use super::angles::{clamp_angle, normalize_angle_limits, wrap_angle};
use crate::math::{almost_equal, shortest_arc};

/// Rotation adjustments smaller than this are treated as "no change".
const MIN_ADJUSTMENT_ANGLE: f32 = 1.0e-3;

const MIN_SWING_AXIS_LENGTH: f32 = 1.0e-3;

/// Type tag for the closed constraint family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    SimpleCone,
    TwistLimitedCone,
    Elbow,
    Knee,
    AcuteEllipsoidalCone,
    DoubleLimitedHinge,
}

/// Value-type constraint descriptor: the sole constructor input and the
/// factory's cache key.
///
/// Parameter layout per kind:
/// - `SimpleCone`: vectors `[forward]`, scalars `[max_angle]`
/// - `TwistLimitedCone`: vectors `[forward]`, scalars `[cone_angle,
///   min_twist, max_twist]`
/// - `Elbow`: vectors `[forward, pivot]`, scalars `[min_bend, max_bend,
///   min_twist, max_twist]`
/// - `Knee`: vectors `[forward, pivot]`, scalars `[min_bend, max_bend]`
/// - `AcuteEllipsoidalCone`: vectors `[forward, up]`, scalars `[forward,
///   up, left, down, right]`
/// - `DoubleLimitedHinge`: vectors `[forward, up]`, scalars `[min_yaw,
///   max_yaw, min_pitch, max_pitch]`
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintInfo {
    pub kind: ConstraintKind,
    pub vectors: Vec<Vec3>,
    pub scalars: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConstraintKey {
    kind: ConstraintKind,
    bits: Vec<u32>,
}

impl ConstraintInfo {
    fn cache_key(&self) -> ConstraintKey {
        let mut bits = Vec::with_capacity(3 * self.vectors.len() + self.scalars.len());
        for vector in &self.vectors {
            bits.extend(vector.to_array().iter().map(|value| value.to_bits()));
        }
        bits.extend(self.scalars.iter().map(|value| value.to_bits()));
        ConstraintKey {
            kind: self.kind,
            bits,
        }
    }
}

/// Minimal local rotation producing the same swing, with all twist removed.
fn minimize_swing_only(forward: Vec3, local_rot: Quat) -> Quat {
    let joint_forward = local_rot * forward;
    let swing_axis = forward.cross(joint_forward);
    if swing_axis.length() > MIN_SWING_AXIS_LENGTH {
        let swing_angle = joint_forward.dot(forward).clamp(-1.0, 1.0).acos();
        Quat::from_axis_angle(swing_axis.normalize(), swing_angle)
    } else {
        Quat::IDENTITY
    }
}

/// Cone about a forward axis; twist about that axis is unconstrained.
///
/// ```text
///        / max_angle
///       /
///   ---@--------> forward
///       \
///        \ max_angle
/// ```
#[derive(Debug, Clone)]
pub struct SimpleCone {
    forward: Vec3,
    cos_cone_angle: f32,
    sin_cone_angle: f32,
}

impl SimpleCone {
    pub fn new(forward_axis: Vec3, max_angle: f32) -> Self {
        let max_angle = max_angle.abs();
        Self {
            forward: forward_axis.normalize(),
            cos_cone_angle: max_angle.cos(),
            sin_cone_angle: max_angle.sin(),
        }
    }

    fn compute_adjusted_local_rot(&self, local_rot: Quat) -> Quat {
        let joint_forward = local_rot * self.forward;
        let forward_component = joint_forward.dot(self.forward);
        if forward_component < self.cos_cone_angle {
            // forward lies outside the cone: project it onto the surface,
            //   projection = (forward part) + (orthogonal part)
            let perp = (joint_forward - forward_component * self.forward).normalize_or_zero();
            let new_joint_forward =
                self.cos_cone_angle * self.forward + self.sin_cone_angle * perp;
            let adjustment = shortest_arc(joint_forward, new_joint_forward);
            (adjustment * local_rot).normalize()
        } else {
            local_rot
        }
    }

    fn minimize_twist(&self, local_rot: Quat) -> Quat {
        minimize_swing_only(self.forward, local_rot)
    }
}

/// Cone about a forward axis with a limited twist range; fits a shoulder.
///
/// ```text
/// View from side:                View with forward out of page:
///                                        max_twist
///        / cone_angle                 | /
///       /                             |/
///   ---@--------> forward        ----(o)----> perp axis
///       \                            /|
///        \ cone_angle               / |
///                            min_twist
/// ```
#[derive(Debug, Clone)]
pub struct TwistLimitedCone {
    forward: Vec3,
    cos_cone_angle: f32,
    sin_cone_angle: f32,
    min_twist: f32,
    max_twist: f32,
}

impl TwistLimitedCone {
    pub fn new(forward_axis: Vec3, cone_angle: f32, min_twist: f32, max_twist: f32) -> Self {
        let (min_twist, max_twist) = normalize_angle_limits(min_twist, max_twist);
        Self {
            forward: forward_axis.normalize(),
            cos_cone_angle: cone_angle.cos(),
            sin_cone_angle: cone_angle.sin(),
            min_twist,
            max_twist,
        }
    }

    fn compute_adjusted_local_rot(&self, local_rot: Quat) -> Quat {
        let mut joint_forward = local_rot * self.forward;
        let mut adjusted = local_rot;
        let forward_component = joint_forward.dot(self.forward);
        if forward_component < self.cos_cone_angle {
            let perp = (joint_forward - forward_component * self.forward).normalize_or_zero();
            let new_joint_forward =
                self.cos_cone_angle * self.forward + self.sin_cone_angle * perp;
            adjusted = shortest_arc(joint_forward, new_joint_forward) * adjusted;
        }

        joint_forward = adjusted * self.forward;

        // two axes perpendicular to joint_forward for measuring twist;
        // fall back to fixed references when forward barely swung
        const MIN_PERP_LENGTH: f32 = 1.0e-3;
        let mut perp_x = self.forward.cross(joint_forward);
        if perp_x.length() < MIN_PERP_LENGTH {
            perp_x = Vec3::Y.cross(self.forward);
            if perp_x.length() < MIN_PERP_LENGTH {
                perp_x = self.forward.cross(Vec3::X);
            }
        }
        let perp_x = perp_x.normalize();
        let perp_y = joint_forward.cross(perp_x);

        let mut joint_perp = adjusted * perp_x;
        let twist = joint_perp.dot(perp_y).atan2(joint_perp.dot(perp_x));

        if twist > self.max_twist || twist < self.min_twist {
            let twist = clamp_angle(twist, self.min_twist, self.max_twist);
            joint_perp -= joint_perp.dot(joint_forward) * joint_forward;
            let new_joint_perp = twist.cos() * perp_x + twist.sin() * perp_y;
            adjusted = shortest_arc(joint_perp, new_joint_perp) * adjusted;
        }
        adjusted.normalize()
    }

    fn minimize_twist(&self, local_rot: Quat) -> Quat {
        // same swing, twist reset to the midpoint of the twist range
        let mid_twist =
            Quat::from_axis_angle(self.forward, 0.5 * (self.min_twist + self.max_twist));
        let joint_forward = local_rot * self.forward;
        let swing_axis = self.forward.cross(joint_forward);
        if swing_axis.length() > MIN_SWING_AXIS_LENGTH {
            let swing_angle = joint_forward.dot(self.forward).clamp(-1.0, 1.0).acos();
            let swing = Quat::from_axis_angle(swing_axis.normalize(), swing_angle);
            swing * mid_twist
        } else {
            mid_twist
        }
    }
}

/// Limited hinge with limited twist about the forward (forearm) axis.
///
/// ```text
/// View from the side,            View with forward out of page:
/// pivot axis out of page:
///                                    up  max_twist
///        / max_bend                   | /
///       /                             |/
///  ---(o)--------+ forward       ----(o)----> left
///       \                            /|
///        \ min_bend                 / |
///                            min_twist
/// ```
#[derive(Debug, Clone)]
pub struct ElbowConstraint {
    forward: Vec3,
    pivot_axis: Vec3,
    left: Vec3,
    min_bend: f32,
    max_bend: f32,
    min_twist: f32,
    max_twist: f32,
}

impl ElbowConstraint {
    pub fn new(
        forward_axis: Vec3,
        pivot_axis: Vec3,
        min_bend: f32,
        max_bend: f32,
        min_twist: f32,
        max_twist: f32,
    ) -> Self {
        let forward = forward_axis.normalize();
        let pivot_axis = forward.cross(pivot_axis.cross(forward)).normalize();
        let left = pivot_axis.cross(forward);
        let (min_bend, max_bend) = normalize_angle_limits(min_bend, max_bend);
        let (min_twist, max_twist) = normalize_angle_limits(min_twist, max_twist);
        Self {
            forward,
            pivot_axis,
            left,
            min_bend,
            max_bend,
            min_twist,
            max_twist,
        }
    }

    fn compute_adjusted_local_rot(&self, local_rot: Quat) -> Quat {
        // swing the rotated forward axis back into the hinge plane
        let joint_forward = local_rot * self.forward;
        let projected = joint_forward - joint_forward.dot(self.pivot_axis) * self.pivot_axis;
        let mut adjusted = shortest_arc(joint_forward, projected) * local_rot;

        // twist is measured about the pivot axis and corrected before bend,
        // since removing twist changes the bend measurement
        let twisted_pivot = adjusted * self.pivot_axis;
        let cos_part = twisted_pivot.dot(self.pivot_axis);
        let sin_part = (adjusted * self.left).dot(self.pivot_axis);
        let twist = sin_part.atan2(cos_part);

        let mut new_joint_forward = adjusted * self.forward;
        if twist < self.min_twist || twist > self.max_twist {
            let twist = clamp_angle(twist, self.min_twist, self.max_twist);
            let swung_left = self.pivot_axis.cross(new_joint_forward);
            let new_twisted_pivot = twist.cos() * self.pivot_axis - twist.sin() * swung_left;
            adjusted = shortest_arc(twisted_pivot, new_twisted_pivot) * adjusted;
            new_joint_forward = adjusted * self.forward;
        }

        let bend = new_joint_forward
            .dot(self.left)
            .atan2(new_joint_forward.dot(self.forward));
        if bend > self.max_bend || bend < self.min_bend {
            let bend = clamp_angle(bend, self.min_bend, self.max_bend);
            let clamped_forward = bend.cos() * self.forward + bend.sin() * self.left;
            adjusted = shortest_arc(joint_forward, clamped_forward) * adjusted;
        }
        adjusted.normalize()
    }

    fn minimize_twist(&self, local_rot: Quat) -> Quat {
        // Treat all swing as bend about the pivot and center the twist.
        // An out-of-range bend may flip sign when the flipped angle lands
        // closer to the midpoint of the bend range.
        let joint_forward = local_rot * self.forward;
        let forward_dot = joint_forward.dot(self.forward);
        let perp_part = joint_forward - forward_dot * self.forward;
        let mut bend_angle = perp_part.length().atan2(forward_dot);
        if bend_angle < self.min_bend || bend_angle > self.max_bend {
            let mid_bend = 0.5 * (self.min_bend + self.max_bend);
            if (-bend_angle - mid_bend).abs() < (bend_angle - mid_bend).abs() {
                bend_angle = -bend_angle;
            }
        }
        let bend = Quat::from_axis_angle(self.pivot_axis, bend_angle);
        let mid_twist =
            Quat::from_axis_angle(self.forward, 0.5 * (self.min_twist + self.max_twist));
        bend * mid_twist
    }
}

/// Pure limited hinge, no twist at all; fits a knee or finger joint.
///
/// ```text
/// View from the side, pivot axis out of page:
///
///        / max_bend
///       /
///  ---(o)--------+
///       \
///        \ min_bend
/// ```
#[derive(Debug, Clone)]
pub struct KneeConstraint {
    forward: Vec3,
    pivot_axis: Vec3,
    left: Vec3,
    min_bend: f32,
    max_bend: f32,
}

impl KneeConstraint {
    pub fn new(forward_axis: Vec3, pivot_axis: Vec3, min_bend: f32, max_bend: f32) -> Self {
        let forward = forward_axis.normalize();
        let pivot_axis = forward.cross(pivot_axis.cross(forward)).normalize();
        let left = pivot_axis.cross(forward);
        let (min_bend, max_bend) = normalize_angle_limits(min_bend, max_bend);
        Self {
            forward,
            pivot_axis,
            left,
            min_bend,
            max_bend,
        }
    }

    fn compute_adjusted_local_rot(&self, local_rot: Quat) -> Quat {
        // carry the rotated pivot back onto the reference pivot, removing
        // every component that is not a bend about the hinge
        let joint_axis = local_rot * self.pivot_axis;
        let mut adjusted = shortest_arc(joint_axis, self.pivot_axis) * local_rot;

        let joint_forward = adjusted * self.forward;
        let bend = joint_forward
            .dot(self.left)
            .atan2(joint_forward.dot(self.forward));
        if bend > self.max_bend || bend < self.min_bend {
            let bend = clamp_angle(bend, self.min_bend, self.max_bend);
            let new_joint_forward = bend.cos() * self.forward + bend.sin() * self.left;
            adjusted = shortest_arc(joint_forward, new_joint_forward) * adjusted;
        }
        adjusted.normalize()
    }

    fn minimize_twist(&self, local_rot: Quat) -> Quat {
        // all swing is assumed to be bend about the pivot; flip the bend
        // sign when that lands closer to the midpoint of the bend range
        let joint_forward = local_rot * self.forward;
        let forward_dot = joint_forward.dot(self.forward);
        let perp_part = joint_forward - forward_dot * self.forward;
        let mut bend_angle = perp_part.length().atan2(forward_dot);
        if bend_angle < self.min_bend || bend_angle > self.max_bend {
            let mid_bend = 0.5 * (self.min_bend + self.max_bend);
            if (-bend_angle - mid_bend).abs() < (bend_angle - mid_bend).abs() {
                bend_angle = -bend_angle;
            }
        }
        Quat::from_axis_angle(self.pivot_axis, bend_angle)
    }
}

/// Cone with asymmetric radii in the up/left/down/right directions.
///
/// The boundary is described by the forward offset of a "cross" of radii;
/// each quadrant of the up/left plane is bounded by the elliptical curve
/// through its two radii. Projection scales the left axis per quadrant so
/// the ellipse becomes a circle in the scaled frame.
///
/// ```text
///     up  left            |
///      | /                | /
///      |/                 |/
///   ---@------------------+
///           forward      /|
///                         |
/// ```
#[derive(Debug, Clone)]
pub struct AcuteEllipsoidalCone {
    forward: Vec3,
    up: Vec3,
    left: Vec3,
    quadrant_scales: [f32; 4],
    quadrant_cos_angles: [f32; 4],
    quadrant_cot_angles: [f32; 4],
}

impl AcuteEllipsoidalCone {
    pub fn new(
        forward_axis: Vec3,
        up_axis: Vec3,
        forward: f32,
        up: f32,
        left: f32,
        down: f32,
        right: f32,
    ) -> Self {
        let up_axis = up_axis.normalize();
        let forward_axis = up_axis.cross(forward_axis).cross(up_axis).normalize();
        let left_axis = up_axis.cross(forward_axis);

        // normalize all radii against the forward offset so the adjacent
        // side of every triangle has length 1.0
        let up = (up / forward).abs();
        let left = (left / forward).abs();
        let down = (down / forward).abs();
        let right = (right / forward).abs();

        // quadrant indices with forward pointing into the page:
        //             up
        //              |
        //          1   |   0
        //  left ------(x)------ right
        //          2   |   3
        //            down
        let quadrant_scales = [up / right, up / left, down / left, down / right];
        let up_cos = 1.0 / (up * up + 1.0).sqrt();
        let down_cos = 1.0 / (down * down + 1.0).sqrt();
        Self {
            forward: forward_axis,
            up: up_axis,
            left: left_axis,
            quadrant_scales,
            quadrant_cos_angles: [up_cos, up_cos, down_cos, down_cos],
            quadrant_cot_angles: [1.0 / up, 1.0 / up, 1.0 / down, 1.0 / down],
        }
    }

    fn compute_adjusted_local_rot(&self, local_rot: Quat) -> Quat {
        let joint_forward = local_rot * self.forward;

        let up_component = joint_forward.dot(self.up);
        let left_component = joint_forward.dot(self.left);
        let quadrant = if up_component < 0.0 {
            if left_component < 0.0 {
                2
            } else {
                3
            }
        } else if left_component < 0.0 {
            1
        } else {
            0
        };

        // scale the left axis into the frame where the ellipse is a circle
        let scaled_left_component = left_component * self.quadrant_scales[quadrant];
        let forward_component = joint_forward.dot(self.forward);
        let scaled_joint_forward = forward_component * self.forward
            + up_component * self.up
            + scaled_left_component * self.left;
        // the scaled vector is not normalized, so the forward component must
        // be rescaled before comparing against the quadrant cosine
        if forward_component / scaled_joint_forward.length() < self.quadrant_cos_angles[quadrant] {
            // outside the cone: keep the orthogonal components and rebuild
            // the forward leg from the cotangent of the quadrant angle
            let orthogonal_component = (scaled_left_component * scaled_left_component
                + up_component * up_component)
                .sqrt();
            let corrected_forward = orthogonal_component * self.quadrant_cot_angles[quadrant];
            let new_joint_forward = corrected_forward * self.forward
                + up_component * self.up
                + left_component * self.left;
            let adjustment = shortest_arc(joint_forward, new_joint_forward);
            (adjustment * local_rot).normalize()
        } else {
            local_rot
        }
    }
}

/// Limited yaw and pitch with zero twist; fits a wrist or first finger bone.
///
/// ```text
/// View from above,                 View from the right
/// up out of page:                  (right-hand rule):
///
///   left axis                         up axis
///      |                                |
///      | / max_yaw                      | / min_pitch
///      |/                               |/
///  ---(o)--------> forward          ---(x)--------> forward
///    up \                          left \
///        \ min_yaw                       \ max_pitch
/// ```
#[derive(Debug, Clone)]
pub struct DoubleLimitedHinge {
    forward: Vec3,
    up: Vec3,
    left: Vec3,
    min_yaw: f32,
    max_yaw: f32,
    min_pitch: f32,
    max_pitch: f32,
}

impl DoubleLimitedHinge {
    pub fn new(
        forward_axis: Vec3,
        up_axis: Vec3,
        min_yaw: f32,
        max_yaw: f32,
        min_pitch: f32,
        max_pitch: f32,
    ) -> Self {
        let forward = forward_axis.normalize();
        let up = forward.cross(up_axis.cross(forward)).normalize();
        let left = up.cross(forward);
        let (min_yaw, max_yaw) = normalize_angle_limits(min_yaw, max_yaw);

        // pitch stays within [-PI/2, PI/2] by construction
        let mut min_pitch = wrap_angle(min_pitch).clamp(-FRAC_PI_2, FRAC_PI_2);
        let mut max_pitch = wrap_angle(max_pitch).clamp(-FRAC_PI_2, FRAC_PI_2);
        if min_pitch > max_pitch {
            std::mem::swap(&mut min_pitch, &mut max_pitch);
        }
        Self {
            forward,
            up,
            left,
            min_yaw,
            max_yaw,
            min_pitch,
            max_pitch,
        }
    }

    fn compute_adjusted_local_rot(&self, local_rot: Quat) -> Quat {
        // eliminate twist by forcing the rotated left axis back into the
        // horizontal plane
        let joint_left = local_rot * self.left;
        let adjustment =
            shortest_arc(joint_left, joint_left - joint_left.dot(self.up) * self.up);
        let mut adjusted = adjustment * local_rot;

        let joint_forward = adjusted * self.forward;

        // yaw about the up axis
        let mut up_component = joint_forward.dot(self.up);
        let mut horizontal_axis = joint_forward - up_component * self.up;
        let yaw = horizontal_axis
            .dot(self.left)
            .atan2(horizontal_axis.dot(self.forward));
        if yaw > self.max_yaw || yaw < self.min_yaw {
            let yaw = clamp_angle(yaw, self.min_yaw, self.max_yaw);
            horizontal_axis = yaw.cos() * self.forward + yaw.sin() * self.left;
        } else {
            horizontal_axis = horizontal_axis.normalize_or_zero();
        }

        // pitch axis is `left`, so by the right-hand rule positive pitch
        // drops the forward axis down, hence the negated sine term
        let mut horizontal_component = (1.0 - up_component * up_component).max(0.0).sqrt();
        let pitch = (-up_component).atan2(horizontal_component);
        if pitch > self.max_pitch || pitch < self.min_pitch {
            let pitch = clamp_angle(pitch, self.min_pitch, self.max_pitch);
            up_component = -pitch.sin();
            horizontal_component = (1.0 - up_component * up_component).max(0.0).sqrt();
        }

        let new_joint_forward =
            (horizontal_component * horizontal_axis + up_component * self.up).normalize_or_zero();
        if joint_forward.distance(new_joint_forward) > 1.0e-3 {
            adjusted = shortest_arc(joint_forward, new_joint_forward) * adjusted;
        }
        adjusted.normalize()
    }

    fn minimize_twist(&self, local_rot: Quat) -> Quat {
        // twist elimination alone: force the left axis into the horizontal
        // plane, leaving yaw and pitch as they are
        let joint_left = local_rot * self.left;
        let adjustment =
            shortest_arc(joint_left, joint_left - joint_left.dot(self.up) * self.up);
        (adjustment * local_rot).normalize()
    }
}

/// Closed family of rotational-limit geometries.
///
/// The variant set is fixed, so operations dispatch through a `match`
/// rather than an open trait.
#[derive(Debug, Clone)]
pub enum Constraint {
    SimpleCone(SimpleCone),
    TwistLimitedCone(TwistLimitedCone),
    Elbow(ElbowConstraint),
    Knee(KneeConstraint),
    AcuteEllipsoidalCone(AcuteEllipsoidalCone),
    DoubleLimitedHinge(DoubleLimitedHinge),
}

impl Constraint {
    /// Build a constraint from its descriptor. Returns `None` when the
    /// descriptor does not carry enough parameters for its kind.
    pub fn from_info(info: &ConstraintInfo) -> Option<Self> {
        let vectors = &info.vectors;
        let scalars = &info.scalars;
        match info.kind {
            ConstraintKind::SimpleCone if !vectors.is_empty() && !scalars.is_empty() => {
                Some(Self::SimpleCone(SimpleCone::new(vectors[0], scalars[0])))
            }
            ConstraintKind::TwistLimitedCone if !vectors.is_empty() && scalars.len() > 2 => {
                Some(Self::TwistLimitedCone(TwistLimitedCone::new(
                    vectors[0], scalars[0], scalars[1], scalars[2],
                )))
            }
            ConstraintKind::Elbow if vectors.len() > 1 && scalars.len() > 3 => {
                Some(Self::Elbow(ElbowConstraint::new(
                    vectors[0], vectors[1], scalars[0], scalars[1], scalars[2], scalars[3],
                )))
            }
            ConstraintKind::Knee if vectors.len() > 1 && scalars.len() > 1 => Some(Self::Knee(
                KneeConstraint::new(vectors[0], vectors[1], scalars[0], scalars[1]),
            )),
            ConstraintKind::AcuteEllipsoidalCone if vectors.len() > 1 && scalars.len() > 4 => {
                Some(Self::AcuteEllipsoidalCone(AcuteEllipsoidalCone::new(
                    vectors[0], vectors[1], scalars[0], scalars[1], scalars[2], scalars[3],
                    scalars[4],
                )))
            }
            ConstraintKind::DoubleLimitedHinge if vectors.len() > 1 && scalars.len() > 3 => {
                Some(Self::DoubleLimitedHinge(DoubleLimitedHinge::new(
                    vectors[0], vectors[1], scalars[0], scalars[1], scalars[2], scalars[3],
                )))
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> ConstraintKind {
        match self {
            Self::SimpleCone(_) => ConstraintKind::SimpleCone,
            Self::TwistLimitedCone(_) => ConstraintKind::TwistLimitedCone,
            Self::Elbow(_) => ConstraintKind::Elbow,
            Self::Knee(_) => ConstraintKind::Knee,
            Self::AcuteEllipsoidalCone(_) => ConstraintKind::AcuteEllipsoidalCone,
            Self::DoubleLimitedHinge(_) => ConstraintKind::DoubleLimitedHinge,
        }
    }

    /// Every constraint has a forward axis.
    pub fn forward_axis(&self) -> Vec3 {
        match self {
            Self::SimpleCone(c) => c.forward,
            Self::TwistLimitedCone(c) => c.forward,
            Self::Elbow(c) => c.forward,
            Self::Knee(c) => c.forward,
            Self::AcuteEllipsoidalCone(c) => c.forward,
            Self::DoubleLimitedHinge(c) => c.forward,
        }
    }

    pub fn allows_twist(&self) -> bool {
        !matches!(self, Self::Knee(_))
    }

    /// Project a local rotation back into this constraint's valid region.
    pub fn compute_adjusted_local_rot(&self, local_rot: Quat) -> Quat {
        match self {
            Self::SimpleCone(c) => c.compute_adjusted_local_rot(local_rot),
            Self::TwistLimitedCone(c) => c.compute_adjusted_local_rot(local_rot),
            Self::Elbow(c) => c.compute_adjusted_local_rot(local_rot),
            Self::Knee(c) => c.compute_adjusted_local_rot(local_rot),
            Self::AcuteEllipsoidalCone(c) => c.compute_adjusted_local_rot(local_rot),
            Self::DoubleLimitedHinge(c) => c.compute_adjusted_local_rot(local_rot),
        }
    }

    /// Canonical orientation with the same swing but twist reset to this
    /// constraint's preferred value.
    pub fn minimize_twist(&self, local_rot: Quat) -> Quat {
        match self {
            Self::SimpleCone(c) => minimize_swing_only(c.forward, local_rot),
            Self::TwistLimitedCone(c) => c.minimize_twist(local_rot),
            Self::Elbow(c) => c.minimize_twist(local_rot),
            Self::Knee(c) => c.minimize_twist(local_rot),
            Self::AcuteEllipsoidalCone(c) => minimize_swing_only(c.forward, local_rot),
            Self::DoubleLimitedHinge(c) => c.minimize_twist(local_rot),
        }
    }

    /// Projection with change detection: `Some(adjusted)` only when the
    /// adjustment exceeds the numeric tolerance.
    pub fn adjust(&self, local_rot: Quat) -> Option<Quat> {
        let adjusted = self.compute_adjusted_local_rot(local_rot);
        if almost_equal(adjusted, local_rot, MIN_ADJUSTMENT_ANGLE) {
            None
        } else {
            Some(adjusted)
        }
    }
}

/// Deduplicating constraint cache.
///
/// Constraints are stateless once constructed, so joints with identical
/// descriptors (across any number of skeleton instances) share a single
/// instance.
#[derive(Debug, Default)]
pub struct ConstraintFactory {
    constraints: HashMap<ConstraintKey, Arc<Constraint>>,
}

impl ConstraintFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the shared constraint for `info`, building it on first use.
    /// Malformed descriptors are logged and yield `None`.
    pub fn get_constraint(&mut self, info: &ConstraintInfo) -> Option<Arc<Constraint>> {
        let key = info.cache_key();
        if let Some(constraint) = self.constraints.get(&key) {
            return Some(constraint.clone());
        }
        let Some(constraint) = Constraint::from_info(info) else {
            log::warn!("failed to build {:?} constraint: bad descriptor", info.kind);
            return None;
        };
        let constraint = Arc::new(constraint);
        self.constraints.insert(key, constraint.clone());
        Some(constraint)
    }

    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::{FRAC_PI_2, FRAC_PI_4, PI, TAU};

    const TOL: f32 = 2.0e-3;
    const LOOSE_TOL: f32 = 1.0e-2;

    fn bend(axis: Vec3, angle: f32) -> Quat {
        Quat::from_axis_angle(axis.normalize(), angle)
    }

    #[test]
    fn simple_cone_accepts_in_range_bend() {
        let cone = SimpleCone::new(Vec3::Y, FRAC_PI_4);
        for i in 0..3 {
            let azimuth = TAU * i as f32 / 3.0;
            let pivot = azimuth.cos() * Vec3::X + azimuth.sin() * Vec3::Z;
            for angle in [FRAC_PI_4, 0.5 * FRAC_PI_4, -FRAC_PI_4] {
                let q = bend(pivot, angle);
                assert!(almost_equal(cone.compute_adjusted_local_rot(q), q, TOL));
            }
        }
    }

    #[test]
    fn simple_cone_does_not_constrain_twist() {
        let cone = SimpleCone::new(Vec3::Y, FRAC_PI_4);
        let q = bend(Vec3::X, 0.5 * FRAC_PI_4) * bend(Vec3::Y, 1.3);
        assert!(almost_equal(cone.compute_adjusted_local_rot(q), q, LOOSE_TOL));
    }

    #[test]
    fn simple_cone_clamps_excess_bend() {
        let cone = SimpleCone::new(Vec3::Y, FRAC_PI_4);
        let q = bend(Vec3::X, FRAC_PI_4 + 0.2);
        let adjusted = cone.compute_adjusted_local_rot(q);
        assert!(almost_equal(adjusted, bend(Vec3::X, FRAC_PI_4), TOL));
    }

    #[test]
    fn simple_cone_contains_forward_after_adjustment() {
        let cone = SimpleCone::new(Vec3::Y, FRAC_PI_4);
        for angle in [1.0, 1.5, 2.5, 3.0] {
            let adjusted = cone.compute_adjusted_local_rot(bend(Vec3::Z, angle));
            let forward_cos = (adjusted * Vec3::Y).dot(Vec3::Y);
            assert!(forward_cos >= FRAC_PI_4.cos() - 1.0e-3);
        }
    }

    #[test]
    fn simple_cone_projection_is_idempotent() {
        let cone = SimpleCone::new(Vec3::Y, FRAC_PI_4);
        let once = cone.compute_adjusted_local_rot(bend(Vec3::X, 1.2) * bend(Vec3::Y, 0.7));
        let twice = cone.compute_adjusted_local_rot(once);
        assert!(almost_equal(once, twice, TOL));
    }

    #[test]
    fn simple_cone_minimize_twist_removes_twist() {
        let cone = SimpleCone::new(Vec3::Y, FRAC_PI_4);
        let swing = bend(Vec3::X, FRAC_PI_4 + 0.1);
        let q = swing * bend(Vec3::Y, 1.23);
        assert!(almost_equal(cone.minimize_twist(q), swing, 3.0e-3));
    }

    #[test]
    fn twist_limited_cone_accepts_in_range_rotation() {
        let cone = TwistLimitedCone::new(Vec3::Y, FRAC_PI_4, -PI / 6.0, PI / 5.0);
        let q = bend(Vec3::X, 0.3) * bend(Vec3::Y, 0.2);
        assert!(almost_equal(cone.compute_adjusted_local_rot(q), q, TOL));
    }

    #[test]
    fn twist_limited_cone_clamps_twist() {
        let cone = TwistLimitedCone::new(Vec3::Y, FRAC_PI_4, -PI / 6.0, PI / 5.0);
        let q = bend(Vec3::X, 0.3) * bend(Vec3::Y, 1.0);
        let expected = bend(Vec3::X, 0.3) * bend(Vec3::Y, PI / 5.0);
        assert!(almost_equal(cone.compute_adjusted_local_rot(q), expected, TOL));
    }

    #[test]
    fn twist_limited_cone_minimize_twist_centers_twist() {
        let cone = TwistLimitedCone::new(Vec3::Y, FRAC_PI_4, -PI / 6.0, PI / 5.0);
        let mid_twist = 0.5 * (-PI / 6.0 + PI / 5.0);
        let q = bend(Vec3::X, 0.3) * bend(Vec3::Y, 0.5);
        let expected = bend(Vec3::X, 0.3) * bend(Vec3::Y, mid_twist);
        assert!(almost_equal(cone.minimize_twist(q), expected, 3.0e-3));
    }

    #[test]
    fn elbow_accepts_in_range_rotation() {
        let elbow = ElbowConstraint::new(Vec3::Y, Vec3::X, -0.1, 0.9 * PI, -PI / 6.0, PI / 5.0);
        let q = bend(Vec3::X, 0.5) * bend(Vec3::Y, 0.2);
        assert!(almost_equal(elbow.compute_adjusted_local_rot(q), q, TOL));
    }

    #[test]
    fn elbow_clamps_twist_before_bend() {
        let elbow = ElbowConstraint::new(Vec3::Y, Vec3::X, -0.1, 0.9 * PI, -PI / 6.0, PI / 5.0);
        let q = bend(Vec3::X, 0.5) * bend(Vec3::Y, 1.0);
        let expected = bend(Vec3::X, 0.5) * bend(Vec3::Y, PI / 5.0);
        assert!(almost_equal(elbow.compute_adjusted_local_rot(q), expected, TOL));
    }

    #[test]
    fn elbow_clamps_excess_bend() {
        let elbow = ElbowConstraint::new(Vec3::Y, Vec3::X, -0.1, 0.9 * PI, -PI / 6.0, PI / 5.0);
        let q = bend(Vec3::X, 0.95 * PI);
        let expected = bend(Vec3::X, 0.9 * PI);
        assert!(almost_equal(elbow.compute_adjusted_local_rot(q), expected, TOL));
    }

    #[test]
    fn elbow_swings_forward_into_hinge_plane() {
        let elbow = ElbowConstraint::new(Vec3::Y, Vec3::X, -0.1, 0.9 * PI, -PI / 6.0, PI / 5.0);
        // swing partly about the out-of-plane axis
        let q = bend(Vec3::Z, 0.2) * bend(Vec3::X, 0.5);
        let adjusted = elbow.compute_adjusted_local_rot(q);
        let forward = adjusted * Vec3::Y;
        assert!(forward.dot(Vec3::X).abs() < LOOSE_TOL);
    }

    #[test]
    fn elbow_minimize_twist_centers_twist_and_keeps_bend() {
        let elbow = ElbowConstraint::new(Vec3::Y, Vec3::X, -0.1, 0.9 * PI, -PI / 6.0, PI / 5.0);
        let mid_twist = 0.5 * (-PI / 6.0 + PI / 5.0);
        let q = bend(Vec3::X, 0.5) * bend(Vec3::Y, 1.0);
        let expected = bend(Vec3::X, 0.5) * bend(Vec3::Y, mid_twist);
        assert!(almost_equal(elbow.minimize_twist(q), expected, 3.0e-3));
    }

    #[test]
    fn knee_accepts_in_range_bend() {
        let knee = KneeConstraint::new(Vec3::Y, Vec3::X, -FRAC_PI_4, FRAC_PI_2);
        for angle in [-FRAC_PI_4, 0.0, 0.5 * (FRAC_PI_2 - FRAC_PI_4), FRAC_PI_2] {
            let q = bend(Vec3::X, angle);
            assert!(almost_equal(knee.compute_adjusted_local_rot(q), q, TOL));
        }
    }

    #[test]
    fn knee_clamps_bend_to_limits() {
        let knee = KneeConstraint::new(Vec3::Y, Vec3::X, -FRAC_PI_4, FRAC_PI_2);
        let adjusted = knee.compute_adjusted_local_rot(bend(Vec3::X, FRAC_PI_2 + 0.01));
        assert!(almost_equal(adjusted, bend(Vec3::X, FRAC_PI_2), TOL));
        let adjusted = knee.compute_adjusted_local_rot(bend(Vec3::X, -FRAC_PI_4 - 0.01));
        assert!(almost_equal(adjusted, bend(Vec3::X, -FRAC_PI_4), TOL));
    }

    #[test]
    fn knee_clamps_across_the_invalid_zone() {
        let knee = KneeConstraint::new(Vec3::Y, Vec3::X, -FRAC_PI_4, FRAC_PI_2);
        let mid_bend = 0.5 * (FRAC_PI_2 - FRAC_PI_4);
        let q = bend(Vec3::X, mid_bend - PI + 0.01);
        assert!(almost_equal(
            knee.compute_adjusted_local_rot(q),
            bend(Vec3::X, -FRAC_PI_4),
            TOL
        ));
        let q = bend(Vec3::X, mid_bend + PI - 0.01);
        assert!(almost_equal(
            knee.compute_adjusted_local_rot(q),
            bend(Vec3::X, FRAC_PI_2),
            TOL
        ));
    }

    #[test]
    fn knee_removes_twist() {
        let knee = KneeConstraint::new(Vec3::Y, Vec3::X, -FRAC_PI_4, FRAC_PI_2);
        let mid = bend(Vec3::X, 0.3);
        let q = mid * bend(Vec3::Y, 0.01);
        assert!(almost_equal(knee.compute_adjusted_local_rot(q), mid, TOL));
    }

    #[test]
    fn knee_minimize_twist_moves_bend_onto_pivot() {
        let knee = KneeConstraint::new(Vec3::Y, Vec3::X, -FRAC_PI_4, FRAC_PI_2);
        let bend_angle = FRAC_PI_2 - 0.1;
        let q = bend(Vec3::Z, bend_angle) * bend(Vec3::Y, 1.23);
        let expected = bend(Vec3::X, bend_angle);
        assert!(almost_equal(knee.minimize_twist(q), expected, 3.0e-3));
    }

    #[test]
    fn knee_projection_is_idempotent() {
        let knee = KneeConstraint::new(Vec3::Y, Vec3::X, -FRAC_PI_4, FRAC_PI_2);
        let once = knee.compute_adjusted_local_rot(bend(Vec3::X, 2.0) * bend(Vec3::Y, 0.4));
        let twice = knee.compute_adjusted_local_rot(once);
        assert!(almost_equal(once, twice, TOL));
    }

    #[test]
    fn ellipsoidal_cone_accepts_inside_directions() {
        let tan = |a: f32| a.tan();
        let cone = AcuteEllipsoidalCone::new(
            Vec3::Y,
            Vec3::Z,
            1.0,
            tan(FRAC_PI_4),
            tan(PI / 6.0),
            tan(PI / 8.0),
            tan(PI / 6.0),
        );
        // bend toward up by less than the up radius angle
        let q = bend(Vec3::X, 0.3);
        assert!(almost_equal(cone.compute_adjusted_local_rot(q), q, TOL));
    }

    #[test]
    fn ellipsoidal_cone_clamps_asymmetrically() {
        let tan = |a: f32| a.tan();
        let cone = AcuteEllipsoidalCone::new(
            Vec3::Y,
            Vec3::Z,
            1.0,
            tan(FRAC_PI_4),
            tan(PI / 6.0),
            tan(PI / 8.0),
            tan(PI / 6.0),
        );
        // toward up (rotation about x moves forward toward +z): limit PI/4
        let adjusted = cone.compute_adjusted_local_rot(bend(Vec3::X, FRAC_PI_4 + 0.3));
        let angle = (adjusted * Vec3::Y).dot(Vec3::Y).clamp(-1.0, 1.0).acos();
        assert!((angle - FRAC_PI_4).abs() < LOOSE_TOL);
        // toward down: limit PI/8
        let adjusted = cone.compute_adjusted_local_rot(bend(Vec3::X, -FRAC_PI_4));
        let angle = (adjusted * Vec3::Y).dot(Vec3::Y).clamp(-1.0, 1.0).acos();
        assert!((angle - PI / 8.0).abs() < LOOSE_TOL);
    }

    #[test]
    fn double_limited_hinge_accepts_in_range_yaw_and_pitch() {
        let hinge =
            DoubleLimitedHinge::new(Vec3::Y, Vec3::Z, -PI / 6.0, FRAC_PI_4, -PI / 8.0, PI / 3.0);
        let q = bend(Vec3::Z, 0.2);
        assert!(almost_equal(hinge.compute_adjusted_local_rot(q), q, TOL));
        let q = bend(Vec3::NEG_X, 0.4);
        assert!(almost_equal(hinge.compute_adjusted_local_rot(q), q, TOL));
    }

    #[test]
    fn double_limited_hinge_clamps_yaw() {
        let hinge =
            DoubleLimitedHinge::new(Vec3::Y, Vec3::Z, -PI / 6.0, FRAC_PI_4, -PI / 8.0, PI / 3.0);
        let adjusted = hinge.compute_adjusted_local_rot(bend(Vec3::Z, FRAC_PI_4 + 0.2));
        assert!(almost_equal(adjusted, bend(Vec3::Z, FRAC_PI_4), TOL));
    }

    #[test]
    fn double_limited_hinge_clamps_pitch() {
        let hinge =
            DoubleLimitedHinge::new(Vec3::Y, Vec3::Z, -PI / 6.0, FRAC_PI_4, -PI / 8.0, PI / 3.0);
        let adjusted = hinge.compute_adjusted_local_rot(bend(Vec3::NEG_X, PI / 3.0 + 0.2));
        assert!(almost_equal(adjusted, bend(Vec3::NEG_X, PI / 3.0), TOL));
    }

    #[test]
    fn double_limited_hinge_removes_twist() {
        let hinge =
            DoubleLimitedHinge::new(Vec3::Y, Vec3::Z, -PI / 6.0, FRAC_PI_4, -PI / 8.0, PI / 3.0);
        let q = bend(Vec3::Z, 0.3) * bend(Vec3::Y, 0.4);
        let adjusted = hinge.compute_adjusted_local_rot(q);
        // the left axis is back in the horizontal plane
        let left = adjusted * Vec3::NEG_X;
        assert!(left.dot(Vec3::Z).abs() < LOOSE_TOL);
        assert!((adjusted.length() - 1.0).abs() < 1.0e-4);
    }

    #[test]
    fn constraint_enum_dispatch_matches_variant() {
        let cone = Constraint::SimpleCone(SimpleCone::new(Vec3::Y, FRAC_PI_4));
        assert_eq!(cone.kind(), ConstraintKind::SimpleCone);
        assert!(cone.allows_twist());
        let knee = Constraint::Knee(KneeConstraint::new(Vec3::Y, Vec3::X, 0.0, FRAC_PI_2));
        assert!(!knee.allows_twist());
        assert_eq!(knee.forward_axis(), Vec3::Y);
    }

    #[test]
    fn adjust_reports_no_change_for_valid_rotation() {
        let cone = Constraint::SimpleCone(SimpleCone::new(Vec3::Y, FRAC_PI_4));
        assert!(cone.adjust(bend(Vec3::X, 0.2)).is_none());
        assert!(cone.adjust(bend(Vec3::X, 1.2)).is_some());
    }

    #[test]
    fn factory_shares_identical_descriptors() {
        let mut factory = ConstraintFactory::new();
        let info = ConstraintInfo {
            kind: ConstraintKind::SimpleCone,
            vectors: vec![Vec3::Y],
            scalars: vec![FRAC_PI_4],
        };
        let a = factory.get_constraint(&info).unwrap();
        let b = factory.get_constraint(&info.clone()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.num_constraints(), 1);

        let other = ConstraintInfo {
            scalars: vec![FRAC_PI_2],
            ..info
        };
        let c = factory.get_constraint(&other).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(factory.num_constraints(), 2);
    }

    #[test]
    fn factory_rejects_malformed_descriptors() {
        let mut factory = ConstraintFactory::new();
        let info = ConstraintInfo {
            kind: ConstraintKind::Elbow,
            vectors: vec![Vec3::Y],
            scalars: vec![0.0],
        };
        assert!(factory.get_constraint(&info).is_none());
        assert_eq!(factory.num_constraints(), 0);
    }
}
