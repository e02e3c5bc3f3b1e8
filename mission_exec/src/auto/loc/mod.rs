//! # Localisation module
//!
//! Provides the [`Pose`] type used throughout the autonomy system, the fixed transforms between
//! the survey, world, robot, tool and camera frames, and the guard which ensures the localisation
//! filter has converged before the robot is commanded.
//!
//! The world frame is North-West-Up: +X north, +Y west, +Z up. Headings are measured from +X
//! towards +Y, so a positive heading change is a turn to the left.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod conv_guard;
pub mod transforms;

pub use conv_guard::{ConvGuard, ConvGuardParams, ConvergenceError};

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{fmt, ops::Mul};

use nalgebra::{UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use comms_if::eqpt::loc::FilterState;
use util::raise_error;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The position and attitude of one frame (the body) expressed in another (the frame).
///
/// A pose tagged `frame: World, body: Robot` is the transform `world_from_robot`, it takes a
/// point expressed in the robot frame and expresses it in the world frame.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// The frame this pose is expressed in
    pub frame: Frame,

    /// The frame described by this pose
    pub body: Frame,

    /// Position of the body origin in the frame
    pub position_m: Vector3<f64>,

    /// Attitude of the body in the frame
    pub attitude_q: UnitQuaternion<f64>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Coordinate frames known to the autonomy system.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frame {
    /// Local East-North-Up survey frame the waypoints are given in
    Survey,

    /// North-West-Up frame the filter estimates the robot in
    World,

    /// Robot body frame, +X forward, +Y left, +Z up
    Robot,

    /// The probe tip
    Tool,

    /// Optical frame of a camera, +Z along the optical axis
    Camera,

    /// A blast hole
    Hole,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Pose {
    /// The identity pose of `body` in `frame`.
    pub fn identity(frame: Frame, body: Frame) -> Self {
        Self {
            frame,
            body,
            position_m: Vector3::zeros(),
            attitude_q: UnitQuaternion::identity(),
        }
    }

    /// A pose on the XY plane of `frame` with the given heading.
    pub fn planar(frame: Frame, body: Frame, x_m: f64, y_m: f64, heading_rad: f64) -> Self {
        Self {
            frame,
            body,
            position_m: Vector3::new(x_m, y_m, 0.0),
            attitude_q: UnitQuaternion::from_euler_angles(0.0, 0.0, heading_rad),
        }
    }

    /// Return the heading (angle to the +X axis of the frame) of the body in radians.
    pub fn heading(&self) -> f64 {
        self.attitude_q.euler_angles().2
    }

    /// Return the position of the body on the XY plane of the frame.
    pub fn position2(&self) -> Vector2<f64> {
        self.position_m.xy()
    }

    /// Planar distance between two poses expressed in the same frame.
    pub fn distance2(&self, other: &Pose) -> f64 {
        if self.frame != other.frame {
            raise_error!(
                "Cannot measure distance between poses in {} and {}",
                self.frame,
                other.frame
            );
        }
        (self.position2() - other.position2()).norm()
    }

    /// Return this pose with new frame labels.
    ///
    /// Used when two frames are known to coincide, for instance the tool frame and the hole frame
    /// once the tool is deployed over the hole.
    pub fn relabel(self, frame: Frame, body: Frame) -> Self {
        Self {
            frame,
            body,
            ..self
        }
    }

    /// Return the pose of `frame` in `body`.
    pub fn inverse(&self) -> Self {
        let attitude_q = self.attitude_q.inverse();
        Self {
            frame: self.body,
            body: self.frame,
            position_m: -(attitude_q * self.position_m),
            attitude_q,
        }
    }

    /// Compose `a_from_b` with `b_from_c` into `a_from_c`.
    ///
    /// Composing poses whose frames do not chain is a programming error and will panic.
    pub fn compose(&self, other: &Pose) -> Self {
        if self.body != other.frame {
            raise_error!(
                "Cannot compose {}<-{} with {}<-{}",
                self.frame,
                self.body,
                other.frame,
                other.body
            );
        }

        Self {
            frame: self.frame,
            body: other.body,
            position_m: self.position_m + self.attitude_q * other.position_m,
            attitude_q: self.attitude_q * other.attitude_q,
        }
    }

    /// Express a point given in the body frame in the frame of this pose.
    pub fn transform_point(&self, point_m: &Vector3<f64>) -> Vector3<f64> {
        self.position_m + self.attitude_q * point_m
    }
}

impl Mul for Pose {
    type Output = Pose;

    fn mul(self, rhs: Pose) -> Pose {
        self.compose(&rhs)
    }
}

impl From<&FilterState> for Pose {
    fn from(state: &FilterState) -> Self {
        let [x, y, z] = state.position_m;
        Self {
            frame: Frame::World,
            body: Frame::Robot,
            position_m: Vector3::new(x, y, z),
            attitude_q: UnitQuaternion::from_euler_angles(0.0, 0.0, state.heading_rad),
        }
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}<-{} ({:.3}, {:.3}) m, {:.3} rad",
            self.frame,
            self.body,
            self.position_m.x,
            self.position_m.y,
            self.heading()
        )
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Frame::Survey => "survey",
            Frame::World => "world",
            Frame::Robot => "robot",
            Frame::Tool => "tool",
            Frame::Camera => "camera",
            Frame::Hole => "hole",
        };
        write!(f, "{}", name)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_compose_inverse() {
        let world_from_robot = Pose::planar(Frame::World, Frame::Robot, 2.0, 1.0, FRAC_PI_2);
        let robot_from_tool = Pose {
            frame: Frame::Robot,
            body: Frame::Tool,
            position_m: Vector3::new(0.5, 0.0, -0.3),
            attitude_q: UnitQuaternion::identity(),
        };

        // Facing +Y, so the tool is 0.5 m along +Y from the robot
        let world_from_tool = world_from_robot * robot_from_tool;
        assert_eq!(world_from_tool.frame, Frame::World);
        assert_eq!(world_from_tool.body, Frame::Tool);
        assert!((world_from_tool.position_m - Vector3::new(2.0, 1.5, -0.3)).norm() < 1e-9);

        let back = world_from_tool * robot_from_tool.inverse();
        assert_eq!(back.body, Frame::Robot);
        assert!((back.position_m - world_from_robot.position_m).norm() < 1e-9);
        assert!((back.heading() - FRAC_PI_2).abs() < 1e-9);
    }

    #[test]
    #[should_panic]
    fn test_compose_mismatched_frames() {
        let a = Pose::identity(Frame::World, Frame::Robot);
        let b = Pose::identity(Frame::Camera, Frame::Hole);
        let _ = a * b;
    }

    #[test]
    fn test_from_filter_state() {
        let state = FilterState {
            timestamp: chrono::Utc::now(),
            converged: true,
            position_m: [1.0, -2.0, 0.0],
            heading_rad: 0.25,
        };
        let pose = Pose::from(&state);
        assert_eq!(pose.frame, Frame::World);
        assert!((pose.heading() - 0.25).abs() < 1e-12);
        assert!((pose.position2() - Vector2::new(1.0, -2.0)).norm() < 1e-12);
    }
}
