//! # Localisation Filter Communications Module

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{serde::ts_milliseconds, DateTime, Utc};
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// State reported by the localisation filter in response to a convergence poll.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct FilterState {
    /// UTC timestamp of the estimate
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// True if the filter's uncertainty has settled within its acceptance bounds
    pub converged: bool,

    /// Position of the robot in the world frame, in meters
    pub position_m: [f64; 3],

    /// Heading of the robot in the world frame (angle to the +ve world X axis)
    pub heading_rad: f64,
}

/// A rotation demand sent to the motion base, used to excite the IMU when the filter has
/// diverged.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct RotationDemand {
    /// Angular velocity about the robot's up axis, positive anticlockwise
    pub angular_velocity_rads: f64,

    /// Duration to hold the rotation for
    pub duration_s: f64,
}
