//! # Communications interface crate.
//!
//! Provides all common message definitions exchanged between the mission executable and the
//! external services it orchestrates (filter, track follower, actuator bus and cameras).

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Command and response definitions for equipment (filter, follower, actuators, cameras)
pub mod eqpt;
