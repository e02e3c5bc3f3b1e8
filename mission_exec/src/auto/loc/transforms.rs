//! # Frame transforms
//!
//! Fixed conversions between the survey frame, the world frame, and the robot's mounted
//! equipment.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use nalgebra::{UnitQuaternion, Vector2, Vector3};

use super::{Frame, Pose};

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Convert a local East-North survey offset into the North-West world frame.
pub fn survey_to_world(east_m: f64, north_m: f64) -> Vector2<f64> {
    Vector2::new(north_m, -east_m)
}

/// Pose of the probe tip in the robot frame, from its mounting offset.
pub fn robot_from_tool(offset_m: [f64; 3]) -> Pose {
    Pose {
        frame: Frame::Robot,
        body: Frame::Tool,
        position_m: Vector3::from(offset_m),
        attitude_q: UnitQuaternion::identity(),
    }
}

/// Pose the robot has to reach for the tool to sit over the hole.
///
/// The tool frame coincides with the hole frame when deployed, so
/// `world_from_robot = world_from_hole * inverse(robot_from_tool)`.
pub fn robot_target(world_from_hole: &Pose, robot_from_tool: &Pose) -> Pose {
    let hole_from_robot = robot_from_tool.inverse().relabel(Frame::Hole, Frame::Robot);
    world_from_hole.compose(&hole_from_robot)
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn test_survey_to_world() {
        // 1 m east is 1 m to the right of north, i.e. -Y
        assert_eq!(survey_to_world(1.0, 0.0), Vector2::new(0.0, -1.0));
        assert_eq!(survey_to_world(0.0, 2.0), Vector2::new(2.0, 0.0));
        assert_eq!(survey_to_world(-3.0, 4.0), Vector2::new(4.0, 3.0));
    }

    #[test]
    fn test_robot_target() {
        let tool = robot_from_tool([0.8, 0.0, -0.4]);

        // Hole facing north, the robot must stop short of it by the probe offset
        let hole = Pose::planar(Frame::World, Frame::Hole, 10.0, 5.0, 0.0);
        let target = robot_target(&hole, &tool);
        assert_eq!(target.frame, Frame::World);
        assert_eq!(target.body, Frame::Robot);
        assert!((target.position2() - Vector2::new(9.2, 5.0)).norm() < 1e-9);

        // Facing west
        let hole = Pose::planar(Frame::World, Frame::Hole, 0.0, 0.0, FRAC_PI_2);
        let target = robot_target(&hole, &tool);
        assert!((target.position2() - Vector2::new(0.0, -0.8)).norm() < 1e-9);
        assert!((target.heading() - FRAC_PI_2).abs() < 1e-9);

        // Putting the tool back on gets us to the hole
        let world_from_tool = target * tool;
        assert!((world_from_tool.position2() - hole.position2()).norm() < 1e-9);

        let hole = Pose::planar(Frame::World, Frame::Hole, 1.0, 1.0, PI);
        let target = robot_target(&hole, &tool);
        assert!((target.position2() - Vector2::new(1.8, 1.0)).norm() < 1e-9);
    }
}
