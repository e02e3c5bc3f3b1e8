//! # Autonomy module
//!
//! The autonomy module contains everything needed to take the robot through a survey mission:
//! the waypoint set, localisation checks, path planning and following, vision refinement, the
//! tool sequence and the mission state machine which ties them together.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod loc;
pub mod mission_mgr;
pub mod nav;
pub mod path;
pub mod per;
pub mod tool;
pub mod waypoint;
