//! The IK solver: owns the joint arena, decomposes it into traversal
//! chains, and runs FABRIK with constraint enforcement and de-twisting.
//!
//! FABRIK: Forward And Backward Reaching Inverse Kinematics,
//! <http://andreasaristidou.com/FABRIK.html>. Reach passes preserve bone
//! lengths but ignore constraints; dedicated corrective passes between
//! them enforce the constraints and remove redundant twist.

use glam::{Quat, Vec3};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::constraint::Constraint;
use super::joint::{
    Config, Joint, JointId, FLAG_LOCAL_POS, FLAG_LOCAL_ROT, FLAG_TARGET_POS, FLAG_TARGET_ROT,
    MASK_POS, MASK_ROT,
};
use crate::math::{almost_equal, shortest_arc, Transform};

/// Default acceptable worst-case positional error: half a millimeter.
pub const DEFAULT_ACCEPTABLE_ERROR: f32 = 5.0e-4;

const MIN_FABRIK_ITERATIONS: u32 = 4;
const MAX_FABRIK_ITERATIONS: u32 = 16;
const INITIAL_RELAXATION_FACTOR: f32 = 0.25;
const ROT_CHANGE_TOLERANCE: f32 = 1.0e-3;

/// Per-frame joint targets, keyed by joint id in ascending order.
pub type ConfigMap = BTreeMap<JointId, Config>;

/// Maintains a skeleton of connected joints and computes the parent-local
/// orientations that carry its end-effectors toward their targets.
pub struct Solver {
    skeleton: BTreeMap<JointId, Joint>,
    configs: ConfigMap,

    /// Derived: chain-outer-end id -> ordered joint ids, outer to inner.
    chains: BTreeMap<JointId, Vec<JointId>>,
    /// Whitelist of joints to treat as sub-bases when topology alone is
    /// ambiguous (e.g. chest with two collar children). Non-empty disables
    /// structural branch detection.
    sub_base_ids: BTreeSet<JointId>,
    /// Whitelist of joints at which chains stop outright.
    sub_root_ids: BTreeSet<JointId>,
    active_roots: BTreeSet<JointId>,
    active_joints: Vec<JointId>,
    wrist_ids: Vec<JointId>,
    root_id: JointId,
    acceptable_error: f32,
    last_error: f32,
}

impl Default for Solver {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver {
    pub fn new() -> Self {
        Self {
            skeleton: BTreeMap::new(),
            configs: ConfigMap::new(),
            chains: BTreeMap::new(),
            sub_base_ids: BTreeSet::new(),
            sub_root_ids: BTreeSet::new(),
            active_roots: BTreeSet::new(),
            active_joints: Vec::new(),
            wrist_ids: Vec::new(),
            root_id: -1,
            acceptable_error: DEFAULT_ACCEPTABLE_ERROR,
            last_error: 0.0,
        }
    }

    pub fn set_root_id(&mut self, root_id: JointId) {
        self.root_id = root_id;
    }

    pub fn root_id(&self) -> JointId {
        self.root_id
    }

    pub fn set_acceptable_error(&mut self, slop: f32) {
        self.acceptable_error = slop;
    }

    pub fn set_sub_base_ids(&mut self, ids: BTreeSet<JointId>) {
        self.sub_base_ids = ids;
    }

    pub fn set_sub_root_ids(&mut self, ids: BTreeSet<JointId>) {
        self.sub_root_ids = ids;
    }

    /// Register a joint. Parents must be added before their children, and
    /// `set_root_id` must be called before the root is added so its absent
    /// parent id can be recognized. Invalid registrations are logged and
    /// ignored, leaving the skeleton unchanged.
    pub fn add_joint(
        &mut self,
        joint_id: JointId,
        parent_id: JointId,
        local_pos: Vec3,
        bone: Vec3,
        constraint: Option<Arc<Constraint>>,
    ) {
        if joint_id < 0 {
            log::warn!("failed to add invalid joint_id={joint_id}");
            return;
        }
        if self.skeleton.contains_key(&joint_id) {
            log::warn!("failed to add joint_id={joint_id}: already exists");
            return;
        }
        let mut joint = Joint::new(joint_id, local_pos, bone);
        match self.skeleton.get_mut(&parent_id) {
            Some(parent) => {
                let parent_pose = (parent.world_tip_pos(), parent.world_rot());
                parent.add_child(joint_id);
                joint.set_parent(Some(parent_id));
                joint.reset(Some(parent_pose));
            }
            None => {
                if parent_id >= self.root_id {
                    log::warn!(
                        "failed to add joint_id={joint_id}: could not find parent_id={parent_id}"
                    );
                    return;
                }
                joint.reset(None);
            }
        }
        joint.set_constraint(constraint);
        self.skeleton.insert(joint_id, joint);
    }

    /// Live edit of a registered joint's geometry and constraint.
    pub fn reconfigure_joint(
        &mut self,
        joint_id: JointId,
        local_pos: Vec3,
        bone: Vec3,
        constraint: Option<Arc<Constraint>>,
    ) {
        let Some(joint) = self.skeleton.get_mut(&joint_id) else {
            log::warn!("failed to reconfigure unknown joint_id={joint_id}");
            return;
        };
        joint.reconfigure(local_pos, bone);
        joint.set_constraint(constraint);
    }

    /// Register a wrist joint for the elbow-drop pose heuristic.
    pub fn add_wrist_id(&mut self, wrist_id: JointId) {
        if !self.skeleton.contains_key(&wrist_id) {
            log::warn!("failed to find wrist_id={wrist_id}");
            return;
        }
        self.wrist_ids.push(wrist_id);
    }

    /// Put the skeleton back into its default orientation (e.g. T-pose).
    pub fn reset_skeleton(&mut self) {
        let Some(&first_id) = self.skeleton.keys().next() else {
            return;
        };
        let mut stack = vec![first_id];
        while let Some(id) = stack.pop() {
            let parent_pose = self.parent_pose(id);
            let joint = self.joint_mut(id);
            joint.reset(parent_pose);
            stack.extend(joint.children().iter().copied());
        }
    }

    /// Total offset from the tip of `from_id` to the end of `to_id` along
    /// the ancestor chain, negated when `from_id > to_id`. Useful for
    /// reachability pre-checks.
    pub fn compute_reach(&self, to_id: JointId, from_id: JointId) -> Vec3 {
        let mut ancestor = from_id;
        let mut descendent = to_id;
        let mut swapped = false;
        if ancestor > descendent {
            std::mem::swap(&mut ancestor, &mut descendent);
            swapped = true;
        }
        let mut reach = Vec3::ZERO;
        if let Some(start) = self.skeleton.get(&descendent) {
            let mut chain_reach = start.bone();
            let mut current = Some(start);
            while let Some(joint) = current {
                chain_reach += joint.local_pos();
                match joint.parent() {
                    Some(parent_id) if parent_id == ancestor => {
                        reach = chain_reach;
                        break;
                    }
                    Some(parent_id) => current = self.skeleton.get(&parent_id),
                    None => break,
                }
            }
        }
        if swapped {
            -reach
        } else {
            reach
        }
    }

    /// Solve the IK problem for the given per-joint configs and return the
    /// worst-case positional error.
    ///
    /// When the incoming map is numerically unchanged from the previous
    /// call the previous error is returned without any recomputation.
    pub fn configure_and_solve(&mut self, configs: &ConfigMap) -> f32 {
        if !self.update_joint_configs(configs) {
            // nothing changed, the previous solution stands
            return self.last_error;
        }

        // Relax a fraction toward the rest pose before solving. This return
        // pressure removes floating-point drift that would otherwise wander
        // within the valid zones of the constraints.
        let roots: Vec<JointId> = self.active_roots.iter().copied().collect();
        for root_id in &roots {
            self.relax_rotations_recursively(*root_id, INITIAL_RELAXATION_FACTOR);
        }

        // one unconstrained FABRIK pass to start
        self.execute_fabrik_pass();

        let mut max_error = f32::MAX;
        let mut iteration = 0;
        while iteration < MIN_FABRIK_ITERATIONS
            || (iteration < MAX_FABRIK_ITERATIONS && max_error > self.acceptable_error)
        {
            // pull elbows downward toward a more natural pose
            let wrists = self.wrist_ids.clone();
            for wrist_id in wrists {
                self.drop_elbow(wrist_id);
            }

            // the FABRIK reach passes don't enforce constraints inline,
            // this corrective pass does
            self.enforce_constraints_outward();

            // Excess twist between joints can often be removed without
            // swinging any bone in the world frame. Doing so reduces the
            // spin drift that accumulates within the twist limits.
            let outer_ids: Vec<JointId> = self.chains.keys().copied().collect();
            for outer_id in outer_ids {
                self.untwist_chain(outer_id);
            }

            self.execute_fabrik_pass();

            // constraint violations left by that pass are small once the
            // iteration converges, so they are not re-enforced here
            max_error = self.measure_max_error();
            iteration += 1;
        }
        self.last_error = max_error;
        self.last_error
    }

    pub fn get_joint_local_pos(&self, joint_id: JointId) -> Option<Vec3> {
        self.skeleton.get(&joint_id).map(|joint| joint.local_pos())
    }

    pub fn get_joint_local_rot(&self, joint_id: JointId) -> Option<Quat> {
        self.skeleton.get(&joint_id).map(|joint| joint.local_rot())
    }

    pub fn get_joint_local_transform(&self, joint_id: JointId) -> Option<Transform> {
        self.skeleton
            .get(&joint_id)
            .map(|joint| Transform::new(joint.local_pos(), joint.local_rot()))
    }

    pub fn get_joint_world_tip_pos(&self, joint_id: JointId) -> Option<Vec3> {
        self.skeleton
            .get(&joint_id)
            .map(|joint| joint.world_tip_pos())
    }

    pub fn get_joint_world_end_pos(&self, joint_id: JointId) -> Option<Vec3> {
        self.skeleton
            .get(&joint_id)
            .map(|joint| joint.world_end_pos())
    }

    pub fn get_joint_world_rot(&self, joint_id: JointId) -> Option<Quat> {
        self.skeleton.get(&joint_id).map(|joint| joint.world_rot())
    }

    /// Ids of the joints participating in the current solve.
    pub fn active_joints(&self) -> &[JointId] {
        &self.active_joints
    }

    fn joint(&self, id: JointId) -> &Joint {
        &self.skeleton[&id]
    }

    fn joint_mut(&mut self, id: JointId) -> &mut Joint {
        self.skeleton
            .get_mut(&id)
            .expect("ids held by solver structures are registered")
    }

    fn parent_pose(&self, id: JointId) -> Option<(Vec3, Quat)> {
        let parent_id = self.skeleton.get(&id)?.parent()?;
        let parent = self.joint(parent_id);
        Some((parent.world_tip_pos(), parent.world_rot()))
    }

    fn is_sub_base(&self, joint_id: JointId) -> bool {
        self.sub_base_ids.contains(&joint_id)
    }

    fn is_sub_root(&self, joint_id: JointId) -> bool {
        self.sub_root_ids.contains(&joint_id)
    }

    /// Compare the incoming configs against the previous frame's; rebuild
    /// the chain decomposition only when something actually moved.
    fn update_joint_configs(&mut self, configs: &ConfigMap) -> bool {
        let mut something_changed = configs.len() != self.configs.len();
        if !something_changed {
            for (id, old) in &self.configs {
                let Some(new) = configs.get(id) else {
                    something_changed = true;
                    break;
                };
                if old.flags() != new.flags() {
                    something_changed = true;
                    break;
                }
                let flags = old.flags();
                if flags & FLAG_TARGET_POS != 0
                    && old.target_pos().distance(new.target_pos()) > self.acceptable_error
                {
                    something_changed = true;
                    break;
                }
                if flags & FLAG_TARGET_ROT != 0
                    && !almost_equal(old.target_rot(), new.target_rot(), ROT_CHANGE_TOLERANCE)
                {
                    something_changed = true;
                    break;
                }
                if flags & FLAG_LOCAL_POS != 0
                    && old.local_pos().distance(new.local_pos()) > self.acceptable_error
                {
                    something_changed = true;
                    break;
                }
                if flags & FLAG_LOCAL_ROT != 0
                    && !almost_equal(old.local_rot(), new.local_rot(), ROT_CHANGE_TOLERANCE)
                {
                    something_changed = true;
                    break;
                }
            }
        }
        if something_changed {
            self.configs = configs.clone();
            self.rebuild_all_chains();
        }
        something_changed
    }

    /// Decompose the skeleton into traversal chains for the current
    /// targets.
    ///
    /// Each targeted joint heads a chain walking up through its ancestors
    /// until the root, a targeted ancestor, a sub-root, or a sub-base
    /// (branch point); every discovered sub-base then heads a chain of its
    /// own, repeated until no new sub-bases appear. Chains headed by a
    /// "false" sub-base (non-targeted, not whitelisted, exactly one active
    /// child) are spliced onto the chain that ends at that joint.
    fn rebuild_all_chains(&mut self) {
        // activity, flags and config copies are derived state: recompute
        // them from scratch
        for joint in self.skeleton.values_mut() {
            joint.reset_flags();
        }
        self.chains.clear();
        self.active_roots.clear();

        let configs = self.configs.clone();
        let mut sub_bases: BTreeSet<JointId> = BTreeSet::new();
        for (&joint_id, config) in &configs {
            if !self.skeleton.contains_key(&joint_id) {
                continue;
            }
            self.joint_mut(joint_id).set_config(*config);

            if joint_id == self.root_id {
                // for the root, world frame and local frame coincide
                let flags = config.flags();
                if flags & MASK_ROT != 0 {
                    let rot = if flags & FLAG_LOCAL_ROT != 0 {
                        config.local_rot()
                    } else {
                        config.target_rot()
                    };
                    let joint = self.joint_mut(joint_id);
                    joint.lock_local_rot(rot);
                    joint.activate();
                    self.active_roots.insert(joint_id);
                }
                if flags & MASK_POS != 0 {
                    let pos = if flags & FLAG_LOCAL_POS != 0 {
                        config.local_pos()
                    } else {
                        config.target_pos()
                    };
                    let joint = self.joint_mut(joint_id);
                    joint.set_local_pos(pos);
                    joint.activate();
                }
                continue;
            }

            if config.has_local_rot() {
                self.joint_mut(joint_id).lock_local_rot(config.local_rot());
            }

            if config.has_delegated() {
                // an ancestor's chain covers this target
                continue;
            }

            if config.has_target_pos() {
                let chain = self.build_chain(joint_id, &mut sub_bases);
                self.chains.insert(joint_id, chain);

                // Sequential end-effectors are not guaranteed to be
                // mutually reachable. The child's target wins: pull the
                // parent's target to exactly one bone length away.
                if let Some(parent_id) = self.joint(joint_id).parent() {
                    if let Some(parent_target_pos) = self.joint(parent_id).target_pos() {
                        let child_target_pos = config.target_pos();
                        let direction =
                            (parent_target_pos - child_target_pos).normalize_or_zero();
                        let adjusted = child_target_pos
                            + direction * self.joint(joint_id).local_pos_length();
                        self.joint_mut(parent_id).set_target_pos(adjusted);
                        if let Some(parent_config) = self.configs.get_mut(&parent_id) {
                            parent_config.set_target_pos(adjusted);
                        }
                    }
                }
            } else if config.has_local_pos() {
                let joint = self.joint_mut(joint_id);
                joint.set_local_pos(config.local_pos());
                joint.activate();
            }
        }

        // every sub-base heads its own chain; sub-bases can themselves
        // uncover sub-base ancestors
        while !sub_bases.is_empty() {
            let mut new_sub_bases = BTreeSet::new();
            for joint_id in sub_bases {
                let chain = self.build_chain(joint_id, &mut new_sub_bases);
                self.chains.insert(joint_id, chain);
            }
            sub_bases = new_sub_bases;
        }

        // find chains headed by false sub-bases and splice each onto the
        // chain terminating at its head
        let mut joins: Vec<JointId> = Vec::new();
        for &outer_id in self.chains.keys() {
            let outer = self.joint(outer_id);
            if !outer.has_pos_target()
                && !self.is_sub_base(outer_id)
                && self.single_active_child(outer_id).is_some()
            {
                joins.push(outer_id);
            }
        }
        for id in joins {
            let mut recipient_key = None;
            for (&outer_id, chain) in &self.chains {
                if chain.last() == Some(&id) {
                    recipient_key = Some(outer_id);
                    break;
                }
            }
            if let Some(recipient_key) = recipient_key {
                if let Some(donor) = self.chains.remove(&id) {
                    if let Some(recipient) = self.chains.get_mut(&recipient_key) {
                        recipient.extend_from_slice(&donor[1..]);
                    }
                }
            }
        }

        // chain inner ends with no active parent are the active roots
        let mut root_ids: Vec<JointId> = Vec::new();
        for chain in self.chains.values() {
            if let Some(&base_id) = chain.last() {
                let parent_active = self
                    .joint(base_id)
                    .parent()
                    .map(|parent_id| self.joint(parent_id).is_active())
                    .unwrap_or(false);
                if !parent_active {
                    root_ids.push(base_id);
                }
            }
        }
        self.active_roots.extend(root_ids);

        self.active_joints = self
            .skeleton
            .iter()
            .filter(|(_, joint)| joint.is_active())
            .map(|(&id, _)| id)
            .collect();
    }

    /// Walk from `start_id` up through its ancestors, activating each
    /// joint, stopping inclusively at a sub-root, the root, a targeted
    /// ancestor, or a branch point (which is pushed onto `sub_bases`).
    fn build_chain(&mut self, start_id: JointId, sub_bases: &mut BTreeSet<JointId>) -> Vec<JointId> {
        let mut chain = vec![start_id];
        self.joint_mut(start_id).activate();
        let mut current = self.joint(start_id).parent();
        while let Some(joint_id) = current {
            chain.push(joint_id);
            self.joint_mut(joint_id).activate();
            if self.is_sub_root(joint_id)
                || joint_id == self.root_id
                || self.joint(joint_id).has_pos_target()
            {
                break;
            }
            // a non-empty whitelist replaces structural branch detection
            if (self.sub_base_ids.is_empty() && self.joint(joint_id).children().len() > 1)
                || self.is_sub_base(joint_id)
            {
                sub_bases.insert(joint_id);
                break;
            }
            current = self.joint(joint_id).parent();
        }
        chain
    }

    /// The single active child of `id`, or `None` when there are zero or
    /// several.
    fn single_active_child(&self, id: JointId) -> Option<JointId> {
        let mut active_child = None;
        for &child_id in self.joint(id).children() {
            if self.joint(child_id).is_active() {
                if active_child.is_some() {
                    return None;
                }
                active_child = Some(child_id);
            }
        }
        active_child
    }

    /// The (local-frame, world-frame) position pairs `id` must reconcile:
    /// its own target, or the tips of its active children.
    fn collect_target_positions(&self, id: JointId) -> Vec<(Vec3, Vec3)> {
        let joint = self.joint(id);
        if let Some(target_pos) = joint.target_pos() {
            return vec![(joint.bone(), target_pos)];
        }
        let mut targets = Vec::new();
        for &child_id in joint.children() {
            let child = self.joint(child_id);
            if child.is_active() {
                targets.push((child.local_pos(), child.world_tip_pos()));
            }
        }
        targets
    }

    fn update_child_local_rots(&mut self, id: JointId) {
        let rot = self.joint(id).world_rot();
        let children: Vec<JointId> = self.joint(id).children().to_vec();
        for child_id in children {
            let child = self.joint_mut(child_id);
            if child.is_active() {
                child.update_local_rot(rot);
            }
        }
    }

    fn relax_rotations_recursively(&mut self, root_id: JointId, blend_factor: f32) {
        let blend_factor = blend_factor.clamp(0.0, 1.0);
        let mut stack = vec![root_id];
        while let Some(id) = stack.pop() {
            let parent_pose = self.parent_pose(id);
            self.joint_mut(id).relax_rot(blend_factor, parent_pose);
            let children: Vec<JointId> = self.joint(id).children().to_vec();
            for child_id in children {
                if self.joint(child_id).is_active() {
                    stack.push(child_id);
                }
            }
        }
    }

    fn execute_fabrik_pass(&mut self) {
        let outer_ids: Vec<JointId> = self.chains.keys().copied().collect();

        // the inward pass runs outermost (highest outer-end id) first so a
        // sub-base sees all of its active children already updated
        for &outer_id in outer_ids.iter().rev() {
            self.execute_fabrik_inward(outer_id);
        }

        // the inward pass leaves each inner end's children with stale
        // local rotations
        let roots: Vec<JointId> = self.active_roots.iter().copied().collect();
        for root_id in roots {
            self.update_child_local_rots(root_id);
        }

        // the outward pass solves the combined chains low-to-high
        for &outer_id in &outer_ids {
            self.execute_fabrik_outward(outer_id);
        }
    }

    fn execute_fabrik_inward(&mut self, outer_id: JointId) {
        let chain = self.chains[&outer_id].clone();

        // the outer end either has a target or is a sub-base with active
        // children
        let targets = self.collect_target_positions(outer_id);
        let parent_active = self
            .joint(outer_id)
            .parent()
            .map(|parent_id| self.joint(parent_id).is_active())
            .unwrap_or(false);
        self.joint_mut(outer_id)
            .update_end_inward(&targets, parent_active);
        self.update_child_local_rots(outer_id);

        // Walk toward the inner end, skipping both ends: the outer end was
        // just handled, and the inner end is either another chain's outer
        // end or an active root.
        for i in 1..chain.len().saturating_sub(1) {
            let child_id = chain[i - 1];
            let child = self.joint(child_id);
            let (child_pos, child_local_pos, child_len) = (
                child.world_tip_pos(),
                child.local_pos(),
                child.local_pos_length(),
            );
            let joint = self.joint_mut(chain[i]);
            joint.update_inward(child_pos, child_local_pos, child_len);
            let rot = joint.world_rot();
            self.joint_mut(child_id).update_local_rot(rot);
        }
    }

    fn execute_fabrik_outward(&mut self, outer_id: JointId) {
        let chain = self.chains[&outer_id].clone();
        let last_index = chain.len() - 1;

        // the inner end doesn't move; walk back out toward the outer end
        for i in (1..last_index).rev() {
            let id = chain[i];
            if let Some((parent_pos, parent_rot)) = self.parent_pose(id) {
                self.joint_mut(id).update_outward(parent_pos, parent_rot);
            }
        }

        let targets = self.collect_target_positions(outer_id);
        if let Some((parent_pos, parent_rot)) = self.parent_pose(outer_id) {
            self.joint_mut(outer_id)
                .update_end_outward(&targets, parent_pos, parent_rot);
        }
    }

    /// Enforce every chain's constraints walking from the inner-adjacent
    /// joint out to the outer end.
    fn enforce_constraints_outward(&mut self) {
        let outer_ids: Vec<JointId> = self.chains.keys().copied().collect();
        for outer_id in outer_ids {
            let chain = self.chains[&outer_id].clone();
            let last_index = chain.len() - 1;

            // the chain's inner end doesn't move at this stage
            for i in (0..last_index).rev() {
                let id = chain[i];
                let Some((parent_pos, parent_rot)) = self.parent_pose(id) else {
                    continue;
                };
                let joint = self.joint_mut(id);
                joint.update_pos_and_rot_from_parent(parent_pos, parent_rot);
                if joint.enforce_constraint() {
                    joint.apply_local_rot(parent_rot);
                }
            }
            self.update_child_local_rots(outer_id);
        }
    }

    /// Remove redundant twist along one chain, walking from the
    /// inner-adjacent joint outward. The inner end belongs to another
    /// chain and is left alone, untwisting a joint may counter-rotate its
    /// parent.
    fn untwist_chain(&mut self, outer_id: JointId) {
        let chain = self.chains[&outer_id].clone();
        let last_index = chain.len() - 1;
        for i in (0..last_index).rev() {
            self.untwist_joint(chain[i]);
        }
        self.update_child_local_rots(outer_id);
    }

    fn untwist_joint(&mut self, id: JointId) {
        let Some(parent_id) = self.joint(id).parent() else {
            return;
        };
        let parent_rot = self.joint(parent_id).world_rot();

        if self.joint(id).has_rot_target() {
            let joint = self.joint_mut(id);
            if let Some(target_rot) = joint.target_rot() {
                joint.set_world_rot(target_rot);
                joint.update_local_rot(parent_rot);
            }
            return;
        }
        if self.joint(id).local_rot_locked() {
            return;
        }

        let old_rot = self.joint(id).world_rot();
        self.joint_mut(id).untwist_local_rot();
        let local_rot = self.joint(id).local_rot();
        let mut new_rot = parent_rot * local_rot;

        if !self.joint(parent_id).local_rot_locked() {
            // Some constraints change the world-frame bone direction when
            // their twist is removed. When that happens, counter-rotate the
            // parent about its own bone axis so the end-effector stays put.
            let bone = self.joint(id).bone();
            let old_bone = old_rot * bone;
            let new_bone = new_rot * bone;
            const MIN_DELTA_COEF: f32 = 0.01;
            if (new_bone - old_bone).length() > MIN_DELTA_COEF * bone.length() {
                let parent_bone = self.joint(parent_id).bone();
                let axis = (parent_rot * parent_bone).normalize_or_zero();

                // project both bones onto the plane of the axis and rotate
                // the new one back onto the old
                let old_projected = old_bone - old_bone.dot(axis) * axis;
                let new_projected = new_bone - new_bone.dot(axis) * axis;
                let twist = shortest_arc(new_projected, old_projected);

                let new_parent_rot = (twist * parent_rot).normalize();
                let grandparent_rot = self
                    .joint(parent_id)
                    .parent()
                    .map(|gp_id| self.joint(gp_id).world_rot());
                let parent = self.joint_mut(parent_id);
                parent.set_world_rot(new_parent_rot);
                if let Some(grandparent_rot) = grandparent_rot {
                    parent.update_local_rot(grandparent_rot);
                }
                new_rot = new_parent_rot * local_rot;
            }
        }
        self.joint_mut(id).set_world_rot(new_rot.normalize());
    }

    /// The skeleton relaxes toward the T-pose, which tends to leave elbows
    /// unnaturally high. Rotate each registered wrist's shoulder so the
    /// upper arm hangs below the shoulder-to-hand axis instead, unless the
    /// shoulder has its own position target.
    fn drop_elbow(&mut self, wrist_id: JointId) {
        let Some(elbow_id) = self.joint(wrist_id).parent() else {
            return;
        };
        let Some(shoulder_id) = self.joint(elbow_id).parent() else {
            return;
        };
        if self.joint(shoulder_id).has_pos_target() {
            // whoever set the shoulder's target knows what they are doing
            return;
        }

        let shoulder_tip = self.joint(shoulder_id).world_tip_pos();
        let elbow_tip = self.joint(elbow_id).world_tip_pos();
        let elbow_end = self.joint(elbow_id).world_end_pos();
        let axis = (elbow_end - shoulder_tip).normalize_or_zero();

        let down = Vec3::Z.cross(axis).cross(axis);
        let shoulder_bone = elbow_tip - shoulder_tip;
        let projection = shoulder_bone - shoulder_bone.dot(axis) * axis;
        let adjustment = shortest_arc(projection, down);

        // rotate the shoulder to bring the upper arm down
        let shoulder_parent_rot = self
            .joint(shoulder_id)
            .parent()
            .map(|parent_id| self.joint(parent_id).world_rot());
        let new_shoulder_rot = (adjustment * self.joint(shoulder_id).world_rot()).normalize();
        let shoulder = self.joint_mut(shoulder_id);
        shoulder.set_world_rot(new_shoulder_rot);
        if let Some(shoulder_parent_rot) = shoulder_parent_rot {
            shoulder.update_local_rot(shoulder_parent_rot);
            if shoulder.enforce_constraint() {
                shoulder.apply_local_rot(shoulder_parent_rot);
            }
        }

        // the elbow's local rotation is unchanged but its world pose moved
        let (shoulder_pos, shoulder_rot) = (
            self.joint(shoulder_id).world_tip_pos(),
            self.joint(shoulder_id).world_rot(),
        );
        self.joint_mut(elbow_id)
            .update_pos_and_rot_from_parent(shoulder_pos, shoulder_rot);

        if self.joint(wrist_id).is_active() {
            // only the wrist's local rotation changed, not its world pose
            let elbow_rot = self.joint(elbow_id).world_rot();
            self.joint_mut(wrist_id).update_local_rot(elbow_rot);
        }
    }

    /// Worst distance between a targeted joint's world end position and its
    /// target, over all non-root, non-delegated position targets.
    fn measure_max_error(&self) -> f32 {
        let mut max_error: f32 = 0.0;
        for (&joint_id, config) in &self.configs {
            if joint_id == self.root_id {
                // the root holds its pose, its error is always zero
                continue;
            }
            if config.has_target_pos() && !config.has_delegated() {
                if let Some(joint) = self.skeleton.get(&joint_id) {
                    max_error = max_error.max(joint.world_end_pos().distance(config.target_pos()));
                }
            }
        }
        max_error
    }
}
