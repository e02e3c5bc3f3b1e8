//! # Mission library.
//!
//! This library implements the mission orchestration of the robot: for each surveyed hole it
//! gates on localisation convergence, drives an approach track, refines the hole position with
//! vision, drives the final track and deploys the tool, recovering from failures along the way.
//!
//! The external services (filter, track follower, actuator bus and cameras) are injected as
//! [`eqpt::Services`] so the orchestration can be run against the simulated services in
//! [`sim_client`].

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Autonomy module - everything the mission needs to visit and treat each hole
pub mod auto;

/// Equipment clients - interfaces to the external services the mission orchestrates
pub mod eqpt;

/// Parameters of the mission executable
pub mod params;

/// Simulation client - in-process stand-ins for the external services
pub mod sim_client;

// ------------------------------------------------------------------------------------------------
// EXPORTS
// ------------------------------------------------------------------------------------------------

pub use auto::mission_mgr::{run_mission, MissionMgr, MissionOutcome};
