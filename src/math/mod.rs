//! Math utilities module
//!
//! Provides convenient re-exports from glam plus the pose and rotation
//! helpers the solver builds on.

mod rotation;
mod transform;

pub use rotation::{almost_equal, shortest_arc};
pub use transform::Transform;

// Re-export commonly used glam types
pub use glam::{Mat4, Quat, Vec3};
