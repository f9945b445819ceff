//! Inverse Kinematics module
//!
//! This module contains the joint-tree types, the rotational constraint
//! family, and the FABRIK solver.

pub mod angles;
pub mod constraint;
pub mod joint;
pub mod solver;

pub use constraint::{
    AcuteEllipsoidalCone, Constraint, ConstraintFactory, ConstraintInfo, ConstraintKind,
    DoubleLimitedHinge, ElbowConstraint, KneeConstraint, SimpleCone, TwistLimitedCone,
};
pub use joint::{Config, Joint, JointId};
pub use solver::{ConfigMap, Solver, DEFAULT_ACCEPTABLE_ERROR};
