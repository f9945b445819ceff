//! Skeleton joints and their per-frame target configuration.

use glam::{Quat, Vec3};
use std::sync::Arc;

use super::constraint::Constraint;
use crate::math::shortest_arc;

/// Joint identifier. Ids are topologically ordered: a parent's id is always
/// smaller than its children's.
pub type JointId = i16;

// local flags (parent-frame data)
pub const FLAG_LOCAL_POS: u8 = 1 << 0;
pub const FLAG_LOCAL_ROT: u8 = 1 << 1;
pub const FLAG_DISABLE_CONSTRAINT: u8 = 1 << 2;

// target flags (root-frame data)
pub const FLAG_TARGET_POS: u8 = 1 << 3;
pub const FLAG_TARGET_ROT: u8 = 1 << 4;
pub const FLAG_DELEGATED: u8 = 1 << 5;

pub const MASK_POS: u8 = FLAG_TARGET_POS | FLAG_LOCAL_POS;
pub const MASK_ROT: u8 = FLAG_TARGET_ROT | FLAG_LOCAL_ROT;

/// Per-joint, per-frame bundle of optional target data with an explicit
/// presence bitmask.
///
/// Owned by the animation layer. The solver copies the relevant `Config`
/// onto each joint for the duration of one solve, so no reference outlives
/// the call that supplied it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    local_pos: Vec3,
    local_rot: Quat,
    target_pos: Vec3,
    target_rot: Quat,
    flags: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_pos: Vec3::ZERO,
            local_rot: Quat::IDENTITY,
            target_pos: Vec3::ZERO,
            target_rot: Quat::IDENTITY,
            flags: 0,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    // local data is expressed in the parent's frame

    pub fn set_local_pos(&mut self, pos: Vec3) {
        self.local_pos = pos;
        self.flags |= FLAG_LOCAL_POS;
    }

    pub fn set_local_rot(&mut self, rot: Quat) {
        self.local_rot = rot.normalize();
        self.flags |= FLAG_LOCAL_ROT;
    }

    // target data is expressed in the skeleton's root frame

    pub fn set_target_pos(&mut self, pos: Vec3) {
        self.target_pos = pos;
        self.flags |= FLAG_TARGET_POS;
    }

    pub fn set_target_rot(&mut self, rot: Quat) {
        self.target_rot = rot.normalize();
        self.flags |= FLAG_TARGET_ROT;
    }

    pub fn disable_constraint(&mut self) {
        self.flags |= FLAG_DISABLE_CONSTRAINT;
    }

    /// Mark this target as handled by an ancestor's chain.
    pub fn delegate(&mut self) {
        self.flags |= FLAG_DELEGATED;
    }

    pub fn has_local_pos(&self) -> bool {
        self.flags & FLAG_LOCAL_POS != 0
    }

    pub fn has_local_rot(&self) -> bool {
        self.flags & FLAG_LOCAL_ROT != 0
    }

    pub fn has_target_pos(&self) -> bool {
        self.flags & FLAG_TARGET_POS != 0
    }

    pub fn has_target_rot(&self) -> bool {
        self.flags & FLAG_TARGET_ROT != 0
    }

    pub fn constraint_is_disabled(&self) -> bool {
        self.flags & FLAG_DISABLE_CONSTRAINT != 0
    }

    pub fn has_delegated(&self) -> bool {
        self.flags & FLAG_DELEGATED != 0
    }

    pub fn local_pos(&self) -> Vec3 {
        self.local_pos
    }

    pub fn local_rot(&self) -> Quat {
        self.local_rot
    }

    pub fn target_pos(&self) -> Vec3 {
        self.target_pos
    }

    pub fn target_rot(&self) -> Quat {
        self.target_rot
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Merge-update from a newer config: only present fields overwrite.
    pub fn update_from(&mut self, other: &Config) {
        if self.flags == other.flags {
            *self = *other;
            return;
        }
        if other.has_local_pos() {
            self.set_local_pos(other.local_pos);
        }
        if other.has_local_rot() {
            self.set_local_rot(other.local_rot);
        }
        if other.has_target_pos() {
            self.set_target_pos(other.target_pos);
        }
        if other.has_target_rot() {
            self.set_target_rot(other.target_rot);
        }
        if other.constraint_is_disabled() {
            self.disable_constraint();
        }
    }
}

/// One constrained bone of the skeleton, stored in the solver's id-indexed
/// arena. Parent and children are referenced by id, never by pointer.
///
/// The fundamental pose formulas are:
///
/// ```text
/// pos = parent.pos + parent.rot * local_pos
/// rot = parent.rot * local_rot
/// world_end_pos = pos + rot * bone
/// ```
///
/// where `pos` is the joint's tip in the root frame and `bone` is the fixed
/// offset from tip to end in the joint's own frame.
#[derive(Debug, Clone)]
pub struct Joint {
    id: JointId,
    parent: Option<JointId>,
    children: Vec<JointId>,

    default_local_pos: Vec3,
    local_pos: Vec3,
    pos: Vec3,
    local_rot: Quat,
    rot: Quat,
    bone: Vec3,

    constraint: Option<Arc<Constraint>>,
    local_pos_length: f32,
    config: Option<Config>,
    config_flags: u8,
    is_active: bool,
}

impl Joint {
    pub fn new(id: JointId, local_pos: Vec3, bone: Vec3) -> Self {
        Self {
            id,
            parent: None,
            children: Vec::new(),
            default_local_pos: local_pos,
            local_pos,
            pos: local_pos,
            local_rot: Quat::IDENTITY,
            rot: Quat::IDENTITY,
            bone,
            constraint: None,
            local_pos_length: local_pos.length(),
            config: None,
            // a parentless joint's rotation is locked, see set_parent()
            config_flags: FLAG_LOCAL_ROT,
            is_active: false,
        }
    }

    pub fn id(&self) -> JointId {
        self.id
    }

    pub fn parent(&self) -> Option<JointId> {
        self.parent
    }

    pub fn children(&self) -> &[JointId] {
        &self.children
    }

    pub fn add_child(&mut self, child_id: JointId) {
        self.children.push(child_id);
    }

    /// The root's local orientation is never updated by the IK algorithm:
    /// whatever rotation it has going in is final, so a parentless joint is
    /// flagged as rotation-locked. This also lets the solver assume any
    /// non-locked joint has a parent.
    pub fn set_parent(&mut self, parent: Option<JointId>) {
        self.parent = parent;
        self.config_flags = if parent.is_some() { 0 } else { FLAG_LOCAL_ROT };
    }

    pub fn set_constraint(&mut self, constraint: Option<Arc<Constraint>>) {
        self.constraint = constraint;
    }

    pub fn constraint(&self) -> Option<&Arc<Constraint>> {
        self.constraint.as_ref()
    }

    pub fn reconfigure(&mut self, local_pos: Vec3, bone: Vec3) {
        self.default_local_pos = local_pos;
        self.local_pos = local_pos;
        self.bone = bone;
        self.local_pos_length = local_pos.length();
    }

    /// Restore the rest pose. `parent` is the parent's world pose, if any.
    pub fn reset(&mut self, parent: Option<(Vec3, Quat)>) {
        self.local_pos = self.default_local_pos;
        self.local_rot = Quat::IDENTITY;
        match parent {
            Some((parent_pos, parent_rot)) => {
                self.pos = parent_pos + parent_rot * self.local_pos;
                self.rot = parent_rot;
            }
            None => {
                self.pos = self.local_pos;
                self.rot = self.local_rot;
            }
        }
    }

    /// Blend the local rotation toward identity and refresh the world pose.
    pub fn relax_rot(&mut self, blend_factor: f32, parent: Option<(Vec3, Quat)>) {
        if !self.local_rot_locked() {
            self.local_rot = self.local_rot.lerp(Quat::IDENTITY, blend_factor);
        }
        match parent {
            Some((parent_pos, parent_rot)) => {
                // the parent may have relaxed too, so always recompute
                self.rot = (parent_rot * self.local_rot).normalize();
                self.pos = parent_pos + parent_rot * self.local_pos;
            }
            None => {
                self.rot = self.local_rot;
                self.pos = self.local_pos;
            }
        }
    }

    pub fn set_config(&mut self, config: Config) {
        self.config_flags = config.flags();
        self.config = Some(config);
    }

    pub fn config(&self) -> Option<&Config> {
        self.config.as_ref()
    }

    /// Drop the per-solve config copy and derived state.
    pub fn reset_flags(&mut self) {
        self.config = None;
        self.config_flags = if self.parent.is_some() { 0 } else { FLAG_LOCAL_ROT };
        self.is_active = false;
    }

    pub fn activate(&mut self) {
        self.is_active = true;
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn has_pos_target(&self) -> bool {
        self.config_flags & FLAG_TARGET_POS != 0
    }

    pub fn has_rot_target(&self) -> bool {
        self.config_flags & FLAG_TARGET_ROT != 0
    }

    pub fn has_disabled_constraint(&self) -> bool {
        self.config_flags & FLAG_DISABLE_CONSTRAINT != 0
    }

    /// The local rotation is "locked" while the config's local-rot bit is
    /// set; it is always set for the root.
    pub fn local_rot_locked(&self) -> bool {
        self.config_flags & FLAG_LOCAL_ROT != 0
    }

    pub fn config_flags(&self) -> u8 {
        self.config_flags
    }

    pub fn target_pos(&self) -> Option<Vec3> {
        match &self.config {
            Some(config) if self.has_pos_target() => Some(config.target_pos()),
            _ => None,
        }
    }

    pub fn target_rot(&self) -> Option<Quat> {
        match &self.config {
            Some(config) if self.has_rot_target() => Some(config.target_rot()),
            _ => None,
        }
    }

    /// Overwrite the config copy's target position; a no-op unless a
    /// position target is present.
    pub fn set_target_pos(&mut self, pos: Vec3) {
        if self.config_flags & FLAG_TARGET_POS != 0 {
            if let Some(config) = &mut self.config {
                config.set_target_pos(pos);
            }
        }
    }

    pub fn lock_local_rot(&mut self, local_rot: Quat) {
        self.local_rot = local_rot;
        self.activate();
        if self.parent.is_none() {
            self.rot = local_rot;
        }
    }

    /// Constraint-softened write: blends a quarter of the way toward the
    /// new local rotation so corrections distribute over the iterations.
    pub fn set_local_rot(&mut self, new_local_rot: Quat) {
        if !self.local_rot_locked() {
            const BLEND_COEF: f32 = 0.25;
            self.local_rot = self.local_rot.lerp(new_local_rot, BLEND_COEF);
        }
    }

    pub fn set_world_rot(&mut self, rot: Quat) {
        self.rot = rot;
    }

    /// Only valid before the IK iterations start.
    pub fn set_local_pos(&mut self, pos: Vec3) {
        self.local_pos = pos;
        self.local_pos_length = pos.length();
        if self.parent.is_none() {
            self.pos = pos;
        }
    }

    /// Apply this joint's constraint to its local rotation.
    ///
    /// A locked local rotation acts like a fixed constraint: report
    /// "enforced" so the caller re-derives the world rotation that may have
    /// been optimistically modified.
    pub fn enforce_constraint(&mut self) -> bool {
        if self.local_rot_locked() {
            return true;
        }
        if self.has_disabled_constraint() {
            return false;
        }
        let adjusted = match &self.constraint {
            Some(constraint) => constraint.adjust(self.local_rot),
            None => None,
        };
        if let Some(adjusted) = adjusted {
            self.set_local_rot(adjusted);
            return true;
        }
        false
    }

    /// Recompute the world rotation from the local one, with backpressure
    /// toward an explicit target rotation when one exists.
    pub fn apply_local_rot(&mut self, parent_rot: Quat) {
        if let Some(target_rot) = self.target_rot() {
            const WORLD_ROT_TARGET_BACKPRESSURE_COEF: f32 = 0.5;
            let new_rot = parent_rot * self.local_rot;
            self.rot = target_rot.lerp(new_rot, WORLD_ROT_TARGET_BACKPRESSURE_COEF);
            self.local_rot = (parent_rot.inverse() * self.rot).normalize();
        } else {
            self.rot = (parent_rot * self.local_rot).normalize();
        }
    }

    /// Re-derive the local rotation from the current world rotations.
    pub fn update_local_rot(&mut self, parent_rot: Quat) {
        if !self.local_rot_locked() {
            self.local_rot = (parent_rot.inverse() * self.rot).normalize();
        }
    }

    pub fn update_pos_and_rot_from_parent(&mut self, parent_pos: Vec3, parent_rot: Quat) {
        self.pos = parent_pos + parent_rot * self.local_pos;
        self.rot = (parent_rot * self.local_rot).normalize();
    }

    /// Blend the local rotation a quarter of the way toward its
    /// minimal-twist canonical form: the constraint's preferred twist, or
    /// the bare shortest swing when unconstrained.
    pub fn untwist_local_rot(&mut self) {
        let new_local_rot = match &self.constraint {
            Some(constraint) if !self.has_disabled_constraint() => {
                constraint.minimize_twist(self.local_rot)
            }
            _ => {
                let bone = self.bone.normalize_or_zero();
                let new_bone = self.local_rot * bone;
                let swing_axis = bone.cross(new_bone);
                const MIN_SWING_AXIS_LENGTH: f32 = 1.0e-3;
                if swing_axis.length() > MIN_SWING_AXIS_LENGTH {
                    let swing_angle = new_bone.dot(bone).clamp(-1.0, 1.0).acos();
                    Quat::from_axis_angle(swing_axis.normalize(), swing_angle)
                } else {
                    Quat::IDENTITY
                }
            }
        };
        // a larger blend here makes some joints visibly pop when the swing
        // axis crosses its degenerate-length threshold between passes
        const UNTWIST_BLEND: f32 = 0.25;
        self.local_rot = self.local_rot.lerp(new_local_rot, UNTWIST_BLEND);
    }

    /// FABRIK inward step for a chain's outer end (end-effector or
    /// sub-base). `targets` pairs local-frame offsets with the world
    /// positions they must reach; `parent_active` gates repositioning for
    /// sub-bases. Constraints are not enforced during reach passes.
    pub fn update_end_inward(&mut self, targets: &[(Vec3, Vec3)], parent_active: bool) {
        if let Some(target_rot) = self.target_rot() {
            self.rot = target_rot;
            if let Some(target_pos) = self.target_pos() {
                self.pos = target_pos - self.rot * self.bone;
            }
        } else if targets.len() == 1 {
            let (local, world) = targets[0];
            let bone_dir = (world - self.pos).normalize_or_zero();
            self.pos = world - local.length() * bone_dir;
            let old_bone = self.rot * local;
            self.rot = (shortest_arc(old_bone, bone_dir) * self.rot).normalize();
        } else if !targets.is_empty() {
            let mut new_pos = Vec3::ZERO;
            let mut avg_adjustment = Quat::from_xyzw(0.0, 0.0, 0.0, 0.0);
            for &(local, world) in targets {
                let new_bone = (world - self.pos).normalize_or_zero() * local.length();
                new_pos += world - new_bone;

                let old_bone = self.rot * local;
                let adjustment = shortest_arc(old_bone, new_bone);
                // negate as needed to keep all the averaged terms on the
                // same hypersphere
                avg_adjustment = if adjustment.w < 0.0 {
                    avg_adjustment - adjustment
                } else {
                    avg_adjustment + adjustment
                };
            }
            if parent_active {
                self.pos = new_pos / targets.len() as f32;
            }
            if avg_adjustment.length_squared() > f32::EPSILON {
                self.rot = (avg_adjustment.normalize() * self.rot).normalize();
            }
        }
        // local_rot is updated later, once the parent's pose is known
    }

    /// FABRIK outward step for a chain's outer end.
    pub fn update_end_outward(&mut self, targets: &[(Vec3, Vec3)], parent_pos: Vec3, parent_rot: Quat) {
        self.pos = parent_pos + parent_rot * self.local_pos;

        if self.local_rot_locked() {
            self.rot = parent_rot * self.local_rot;
            return;
        }

        if let Some(target_rot) = self.target_rot() {
            self.rot = target_rot;
            if let Some(target_pos) = self.target_pos() {
                self.pos = target_pos - self.rot * self.bone;
            }
        } else if targets.len() == 1 {
            let (local, world) = targets[0];
            let new_bone = world - self.pos;
            let old_bone = self.rot * local;
            self.rot = (shortest_arc(old_bone, new_bone) * self.rot).normalize();
        } else if !targets.is_empty() {
            let mut avg_adjustment = Quat::from_xyzw(0.0, 0.0, 0.0, 0.0);
            for &(local, world) in targets {
                let new_bone = world - self.pos;
                let old_bone = self.rot * local;
                let adjustment = shortest_arc(old_bone, new_bone);
                avg_adjustment = if adjustment.w < 0.0 {
                    avg_adjustment - adjustment
                } else {
                    avg_adjustment + adjustment
                };
            }
            if avg_adjustment.length_squared() > f32::EPSILON {
                self.rot = (avg_adjustment.normalize() * self.rot).normalize();
            }
        }

        self.update_local_rot(parent_rot);
    }

    /// FABRIK inward step for a mid-chain joint: slide along the line to
    /// the already-updated child, preserving the child's offset length.
    /// The caller refreshes the child's local rotation afterward.
    pub fn update_inward(&mut self, child_pos: Vec3, child_local_pos: Vec3, child_local_pos_length: f32) {
        let bone_dir = (child_pos - self.pos).normalize_or_zero();
        self.pos = child_pos - child_local_pos_length * bone_dir;
        let old_bone = self.rot * child_local_pos;
        self.rot = (shortest_arc(old_bone, bone_dir) * self.rot).normalize();
    }

    /// FABRIK outward step for a mid-chain joint: inherit position from the
    /// already-updated parent, then re-derive rotation so the bone still
    /// points at its old end position.
    pub fn update_outward(&mut self, parent_pos: Vec3, parent_rot: Quat) {
        let old_end_pos = self.pos + self.rot * self.bone;
        self.pos = parent_pos + parent_rot * self.local_pos;
        let new_bone = old_end_pos - self.pos;
        let old_bone = self.rot * self.bone;
        self.rot = (shortest_arc(old_bone, new_bone) * self.rot).normalize();
        self.update_local_rot(parent_rot);
    }

    pub fn local_pos(&self) -> Vec3 {
        self.local_pos
    }

    pub fn local_rot(&self) -> Quat {
        self.local_rot
    }

    pub fn world_tip_pos(&self) -> Vec3 {
        self.pos
    }

    pub fn world_rot(&self) -> Quat {
        self.rot
    }

    pub fn world_end_pos(&self) -> Vec3 {
        self.pos + self.rot * self.bone
    }

    pub fn bone(&self) -> Vec3 {
        self.bone
    }

    pub fn bone_length(&self) -> f32 {
        self.bone.length()
    }

    pub fn local_pos_length(&self) -> f32 {
        self.local_pos_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn config_setters_raise_presence_flags() {
        let mut config = Config::new();
        assert_eq!(config.flags(), 0);
        config.set_target_pos(Vec3::X);
        assert!(config.has_target_pos());
        assert!(!config.has_target_rot());
        config.set_local_rot(Quat::from_rotation_z(0.5));
        assert!(config.has_local_rot());
        assert_eq!(config.flags(), FLAG_TARGET_POS | FLAG_LOCAL_ROT);
    }

    #[test]
    fn config_update_from_merges_present_fields_only() {
        let mut base = Config::new();
        base.set_target_pos(Vec3::X);
        base.set_local_pos(Vec3::Y);

        let mut newer = Config::new();
        newer.set_target_pos(Vec3::Z);
        newer.disable_constraint();

        base.update_from(&newer);
        assert_eq!(base.target_pos(), Vec3::Z);
        assert_eq!(base.local_pos(), Vec3::Y);
        assert!(base.constraint_is_disabled());
    }

    #[test]
    fn config_update_from_identical_masks_overwrites() {
        let mut base = Config::new();
        base.set_target_pos(Vec3::X);
        let mut newer = Config::new();
        newer.set_target_pos(Vec3::Z);
        base.update_from(&newer);
        assert_eq!(base, newer);
    }

    #[test]
    fn parentless_joint_is_rotation_locked() {
        let joint = Joint::new(0, Vec3::ZERO, Vec3::Y);
        assert!(joint.local_rot_locked());
        let mut child = Joint::new(1, Vec3::Y, Vec3::Y);
        child.set_parent(Some(0));
        assert!(!child.local_rot_locked());
    }

    #[test]
    fn reset_follows_parent_pose() {
        let mut joint = Joint::new(1, Vec3::Y, Vec3::Y);
        joint.set_parent(Some(0));
        let parent_rot = Quat::from_rotation_z(FRAC_PI_2);
        joint.reset(Some((Vec3::X, parent_rot)));
        // local offset +Y rotated by 90 degrees about z lands on -X
        let pos = joint.world_tip_pos();
        assert_relative_eq!(pos.x, 0.0, epsilon = 1.0e-6);
        assert_relative_eq!(pos.y, 0.0, epsilon = 1.0e-6);
        assert_eq!(joint.world_rot(), parent_rot);
    }

    #[test]
    fn set_local_rot_blends_toward_target() {
        let mut joint = Joint::new(1, Vec3::Y, Vec3::Y);
        joint.set_parent(Some(0));
        let goal = Quat::from_rotation_z(1.0);
        joint.set_local_rot(goal);
        let angle = joint.local_rot().to_axis_angle().1;
        assert!(angle > 0.0 && angle < 1.0);
        for _ in 0..32 {
            joint.set_local_rot(goal);
        }
        assert!(crate::math::almost_equal(joint.local_rot(), goal, 1.0e-3));
    }

    #[test]
    fn locked_joint_ignores_rotation_writes() {
        let mut joint = Joint::new(0, Vec3::ZERO, Vec3::Y);
        joint.set_local_rot(Quat::from_rotation_z(1.0));
        assert_eq!(joint.local_rot(), Quat::IDENTITY);
    }

    #[test]
    fn world_end_pos_adds_rotated_bone() {
        let mut joint = Joint::new(1, Vec3::ZERO, Vec3::Y);
        joint.set_parent(Some(0));
        joint.update_pos_and_rot_from_parent(Vec3::X, Quat::from_rotation_z(FRAC_PI_2));
        // bone +Y rotated by 90 degrees about z lands on -X
        let end = joint.world_end_pos();
        assert_relative_eq!(end.x, 0.0, epsilon = 1.0e-6);
        assert_relative_eq!(end.y, 0.0, epsilon = 1.0e-6);
    }

    #[test]
    fn enforce_constraint_is_a_noop_when_locked() {
        let mut joint = Joint::new(0, Vec3::ZERO, Vec3::Y);
        assert!(joint.enforce_constraint());
        assert_eq!(joint.local_rot(), Quat::IDENTITY);
    }

    #[test]
    fn update_outward_preserves_end_position() {
        let mut joint = Joint::new(1, Vec3::Y, Vec3::Y);
        joint.set_parent(Some(0));
        joint.reset(Some((Vec3::ZERO, Quat::IDENTITY)));
        // pretend an inward pass displaced the joint sideways
        joint.set_world_rot(Quat::from_rotation_z(0.3));
        let old_end = joint.world_end_pos();
        // re-anchor under a parent that moved along +x
        joint.update_outward(Vec3::new(0.5, 0.0, 0.0), Quat::IDENTITY);
        let tip = joint.world_tip_pos();
        assert_relative_eq!(tip.x, 0.5, epsilon = 1.0e-6);
        assert_relative_eq!(tip.y, 1.0, epsilon = 1.0e-6);
        let new_dir = (joint.world_end_pos() - tip).normalize();
        let old_dir = (old_end - tip).normalize();
        assert_relative_eq!(new_dir.dot(old_dir), 1.0, epsilon = 1.0e-5);
    }
}
