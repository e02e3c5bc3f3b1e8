//! # Mission state
//!
//! The lifecycle states of the mission, the progress record which is checkpointed between
//! waypoints, and the per-waypoint outcome records.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::auto::path::TurnDirection;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Progress of the mission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionState {
    /// The lifecycle state the mission is in
    pub lifecycle: MissionMgrState,

    /// Index of the job being worked on
    pub job_index: usize,

    /// Index of the waypoint being worked on, or the one before a row turn
    pub waypoint_index: usize,

    /// Row of the waypoint being worked on
    pub row_index: usize,

    /// Retries used on the current job
    pub retries: usize,

    /// Waypoints skipped so far
    pub skips: usize,

    /// Time the current lifecycle state was entered
    #[serde(skip)]
    pub stage_started: Option<Instant>,
}

/// A lifecycle state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: MissionMgrState,
    pub to: MissionMgrState,

    /// The job being worked on when the transition happened
    pub job: Job,

    /// Time spent in the `from` state
    pub elapsed_s: f64,

    pub timestamp: DateTime<Utc>,
}

/// Outcome record of a single waypoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaypointRecord {
    pub index: usize,

    pub status: WaypointStatus,

    /// Number of attempts made at the waypoint, including the first
    pub attempts: usize,

    /// Every failure met at the waypoint
    pub failures: Vec<StageFailure>,

    pub finished_at: Option<DateTime<Utc>>,
}

/// A failure of a lifecycle stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: MissionMgrState,
    pub error: String,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// The lifecycle states of a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MissionMgrState {
    Idle,
    Planning,
    Approaching,
    Detecting,
    Refining,
    Executing,
    Deploying,
    Recovering,
    Complete,
    Failed,
}

/// A unit of work in the mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Job {
    /// Visit and treat a waypoint
    Waypoint(usize),

    /// Turn onto the next row after the given waypoint
    RowTurn {
        after: usize,
        direction: TurnDirection,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaypointStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl MissionState {
    pub fn new() -> Self {
        Self {
            lifecycle: MissionMgrState::Idle,
            job_index: 0,
            waypoint_index: 0,
            row_index: 0,
            retries: 0,
            skips: 0,
            stage_started: None,
        }
    }

    /// Seconds spent in the current lifecycle state.
    pub fn stage_elapsed_s(&self) -> f64 {
        self.stage_started
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl Default for MissionState {
    fn default() -> Self {
        Self::new()
    }
}

impl MissionMgrState {
    /// Position of the state in the order a waypoint passes through them.
    ///
    /// Within a job the mission only ever moves forward through this order, except through
    /// `Recovering`.
    pub fn order(&self) -> Option<usize> {
        match self {
            MissionMgrState::Idle => Some(0),
            MissionMgrState::Planning => Some(1),
            MissionMgrState::Approaching => Some(2),
            MissionMgrState::Detecting => Some(3),
            MissionMgrState::Refining => Some(4),
            MissionMgrState::Executing => Some(5),
            MissionMgrState::Deploying => Some(6),
            MissionMgrState::Complete | MissionMgrState::Failed => Some(7),
            MissionMgrState::Recovering => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MissionMgrState::Complete | MissionMgrState::Failed)
    }
}

impl Job {
    /// The waypoint the job belongs to.
    pub fn waypoint_index(&self) -> usize {
        match self {
            Job::Waypoint(i) => *i,
            Job::RowTurn { after, .. } => *after,
        }
    }
}

impl WaypointRecord {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            status: WaypointStatus::Pending,
            attempts: 0,
            failures: Vec::new(),
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            WaypointStatus::Completed | WaypointStatus::Skipped | WaypointStatus::Failed
        )
    }
}

impl fmt::Display for MissionMgrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissionMgrState::Idle => "IDLE",
            MissionMgrState::Planning => "PLANNING",
            MissionMgrState::Approaching => "APPROACHING",
            MissionMgrState::Detecting => "DETECTING",
            MissionMgrState::Refining => "REFINING",
            MissionMgrState::Executing => "EXECUTING",
            MissionMgrState::Deploying => "DEPLOYING",
            MissionMgrState::Recovering => "RECOVERING",
            MissionMgrState::Complete => "COMPLETE",
            MissionMgrState::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Waypoint(i) => write!(f, "waypoint {}", i),
            Job::RowTurn { after, direction } => {
                write!(f, "row turn {:?} after waypoint {}", direction, after)
            }
        }
    }
}
