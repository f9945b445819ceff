//! # skeleton-ik
//!
//! An inverse kinematics solver for articulated skeletons, based on the
//! FABRIK algorithm with per-joint rotational constraints.
//!
//! ## Features
//! - FABRIK (Forward And Backward Reaching Inverse Kinematics) solver over
//!   a whole joint tree, with automatic chain decomposition around branch
//!   points
//! - Six closed-form rotational constraint geometries (cones, hinges,
//!   elbow/knee-style bend-twist limits) behind a deduplicating factory
//! - Per-frame target configuration with change detection and worst-case
//!   error reporting
//!
//! ## Example
//! ```rust,ignore
//! use skeleton_ik::{Config, ConfigMap, Solver};
//! use glam::Vec3;
//!
//! // Register the skeleton once, parents before children.
//! let mut solver = Solver::new();
//! solver.set_root_id(0);
//! solver.add_joint(0, -1, Vec3::ZERO, Vec3::ZERO, None);
//! solver.add_joint(1, 0, Vec3::ZERO, Vec3::Y, None);
//! solver.add_joint(2, 1, Vec3::Y, Vec3::Y, None);
//!
//! // Every frame: hand the solver a map of targets.
//! let mut configs = ConfigMap::new();
//! let mut config = Config::new();
//! config.set_target_pos(Vec3::new(1.0, 1.0, 0.0));
//! configs.insert(2, config);
//! let error = solver.configure_and_solve(&configs);
//! println!("worst-case error: {error}");
//! ```

pub mod ik;
pub mod math;

pub use ik::constraint::{Constraint, ConstraintFactory, ConstraintInfo, ConstraintKind};
pub use ik::{Config, ConfigMap, Joint, JointId, Solver, DEFAULT_ACCEPTABLE_ERROR};
pub use math::Transform;
