use glam::Vec3;
use skeleton_ik::{Config, ConfigMap, ConstraintFactory, ConstraintInfo, ConstraintKind, Solver};
use std::f32::consts::PI;

// one arm hanging off a torso, ids in parent-before-child order
const PELVIS: i16 = 0;
const CHEST: i16 = 1;
const UPPER_ARM: i16 = 2;
const FOREARM: i16 = 3;
const HAND: i16 = 4;

fn main() {
    env_logger::init();

    let mut factory = ConstraintFactory::new();
    let shoulder_cone = factory.get_constraint(&ConstraintInfo {
        kind: ConstraintKind::TwistLimitedCone,
        vectors: vec![Vec3::X],
        scalars: vec![PI / 4.0, -PI / 8.0, PI / 8.0],
    });
    let elbow_hinge = factory.get_constraint(&ConstraintInfo {
        kind: ConstraintKind::Elbow,
        vectors: vec![Vec3::X, Vec3::Z],
        scalars: vec![0.0, 0.75 * PI, -PI / 4.0, PI / 4.0],
    });

    let mut solver = Solver::new();
    solver.set_root_id(PELVIS);
    solver.add_joint(PELVIS, -1, Vec3::ZERO, 0.4 * Vec3::Z, None);
    solver.add_joint(CHEST, PELVIS, 0.4 * Vec3::Z, 0.2 * Vec3::X, None);
    solver.add_joint(UPPER_ARM, CHEST, 0.2 * Vec3::X, 0.3 * Vec3::X, shoulder_cone);
    solver.add_joint(FOREARM, UPPER_ARM, 0.3 * Vec3::X, 0.25 * Vec3::X, elbow_hinge);
    solver.add_joint(HAND, FOREARM, 0.25 * Vec3::X, 0.1 * Vec3::X, None);
    solver.add_wrist_id(HAND);

    println!(
        "arm reach from pelvis: {:.3} m",
        solver.compute_reach(HAND, PELVIS).length()
    );

    // wave the hand target around and report convergence per frame
    for frame in 0..8 {
        let phase = frame as f32 / 8.0 * PI;
        let target = Vec3::new(0.3 + 0.3 * phase.cos(), 0.3 * phase.sin(), 0.4);

        let mut configs = ConfigMap::new();
        let mut config = Config::new();
        config.set_target_pos(target);
        configs.insert(HAND, config);

        let error = solver.configure_and_solve(&configs);
        let end = solver.get_joint_world_end_pos(HAND).unwrap_or(Vec3::ZERO);
        println!(
            "frame {frame}: target ({:+.3} {:+.3} {:+.3}) hand ({:+.3} {:+.3} {:+.3}) error {:.5}",
            target.x, target.y, target.z, end.x, end.y, end.z, error
        );
    }
}
