//! # Mission executable parameters
//!
//! All parameters of the mission are loaded from a single TOML file, one table per module.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Deserialize;

use crate::{
    auto::{
        loc::ConvGuardParams,
        mission_mgr::MissionMgrParams,
        nav::{NavExecParams, PathPlannerParams},
        per::VisionParams,
        tool::ToolParams,
    },
    sim_client::SimParams,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters for the mission executable
#[derive(Debug, Clone, Deserialize)]
pub struct MissionExecParams {
    pub mission: MissionMgrParams,
    pub waypoints: WaypointParams,
    pub planner: PathPlannerParams,
    pub conv_guard: ConvGuardParams,
    pub nav: NavExecParams,
    pub vision: VisionParams,
    pub tool: ToolParams,
    pub sim: SimParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WaypointParams {
    /// Path to the waypoint CSV, relative to the software root.
    pub file: String,

    /// Number of waypoints per row, if the file has no row column.
    #[serde(default)]
    pub row_length: Option<usize>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("{0} must be positive")]
    NotPositive(&'static str),

    #[error("{0} must not be negative")]
    Negative(&'static str),

    #[error("{0} must be between 0 and 1")]
    NotFraction(&'static str),

    #[error("{0} must be at least 1")]
    Zero(&'static str),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl MissionExecParams {
    /// Check the parameters are self consistent.
    pub fn validate(&self) -> Result<(), ParamsError> {
        positive("mission.approach_timeout_s", self.mission.approach_timeout_s)?;
        positive("mission.execute_timeout_s", self.mission.execute_timeout_s)?;
        positive("mission.row_turn_timeout_s", self.mission.row_turn_timeout_s)?;
        positive("mission.deploy_timeout_s", self.mission.deploy_timeout_s)?;
        positive("mission.row_spacing_m", self.mission.row_spacing_m)?;

        not_negative("planner.approach_offset_m", self.planner.approach_offset_m)?;
        positive("planner.straight_spacing_m", self.planner.straight_spacing_m)?;
        positive("planner.turn_spacing_rad", self.planner.turn_spacing_rad)?;
        not_negative("planner.heading_tolerance_rad", self.planner.heading_tolerance_rad)?;
        not_negative("planner.headland_distance_m", self.planner.headland_distance_m)?;

        positive("conv_guard.poll_timeout_s", self.conv_guard.poll_timeout_s)?;
        not_negative("conv_guard.wiggle_duration_s", self.conv_guard.wiggle_duration_s)?;
        not_negative("conv_guard.settle_time_s", self.conv_guard.settle_time_s)?;

        positive("nav.status_period_s", self.nav.status_period_s)?;
        positive("nav.request_timeout_s", self.nav.request_timeout_s)?;

        positive("vision.timeout_s", self.vision.timeout_s)?;
        positive("vision.search_radius_m", self.vision.search_radius_m)?;

        let forward_cam = &self.vision.forward_cam;
        fraction("vision.forward_cam.min_confidence", forward_cam.min_confidence)?;
        at_least_one("vision.forward_cam.sample_count", forward_cam.sample_count)?;
        positive("vision.forward_cam.calib.fx_px", forward_cam.calib.fx_px)?;
        positive("vision.forward_cam.calib.fy_px", forward_cam.calib.fy_px)?;

        let stemming = &self.tool.stemming;
        positive("tool.stemming.alignment_tolerance_m", stemming.alignment_tolerance_m)?;
        positive("tool.stemming.alignment_footprint_m", stemming.alignment_footprint_m)?;
        fraction(
            "tool.stemming.alignment_min_confidence",
            stemming.alignment_min_confidence,
        )?;
        positive("tool.stemming.ack_timeout_s", stemming.ack_timeout_s)?;
        positive("tool.stemming.command_timeout_s", stemming.command_timeout_s)?;
        positive("tool.stemming.translate_speed_ms", stemming.translate_speed_ms)?;
        not_negative("tool.stemming.pulse_open_s", stemming.pulse_open_s)?;
        not_negative("tool.stemming.pulse_close_s", stemming.pulse_close_s)?;

        if let Some(n) = self.waypoints.row_length {
            at_least_one("waypoints.row_length", n)?;
        }

        Ok(())
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), ParamsError> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(ParamsError::NotPositive(name))
    }
}

fn not_negative(name: &'static str, value: f64) -> Result<(), ParamsError> {
    if value >= 0.0 {
        Ok(())
    } else {
        Err(ParamsError::Negative(name))
    }
}

fn fraction(name: &'static str, value: f64) -> Result<(), ParamsError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ParamsError::NotFraction(name))
    }
}

fn at_least_one(name: &'static str, value: usize) -> Result<(), ParamsError> {
    if value >= 1 {
        Ok(())
    } else {
        Err(ParamsError::Zero(name))
    }
}

/// The shipped parameters, with vision and checkpointing turned off so unit tests only depend on
/// the simulated services.
#[cfg(test)]
pub(crate) fn test_params() -> MissionExecParams {
    let mut params: MissionExecParams =
        util::params::from_str(include_str!("../../params/mission_exec.toml"))
            .expect("Shipped parameters don't parse");
    params.vision.enabled = false;
    params.mission.save_checkpoints = false;
    params
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
