//! # Mission manager
//!
//! This module implements the [`MissionMgr`] state machine, which takes the robot through every
//! waypoint of a mission. The mission is broken into jobs: visiting a waypoint, and turning onto
//! the next row after the last waypoint of a row. A waypoint job passes through the states:
//!
//! - `Planning` - Ensure localisation has converged and plan the approach track.
//! - `Approaching` - Drive the approach track, stopping short of the hole.
//! - `Detecting` - Look for the hole with the forward camera. If it isn't found the planned
//!   position is used and `Refining` is skipped.
//! - `Refining` - Plan the final track onto the refined hole position.
//! - `Executing` - Drive the final track.
//! - `Deploying` - Run the tool sequence.
//!
//! A row turn job goes `Planning` -> `Executing` with the four segment turn track.
//!
//! Any stage failure moves the mission to `Recovering`, which retries the stage a limited number
//! of times per job, then skips the waypoint, and once too many waypoints have been skipped
//! moves the mission to `Failed`.
//!
//! Every state transition is logged and published to subscribers, and the mission progress is
//! checkpointed to the session after each job so an interrupted mission can be resumed.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod stages;
pub mod state;

pub use state::{
    Job, MissionMgrState, MissionState, StageFailure, Transition, WaypointRecord, WaypointStatus,
};

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{path::Path, time::Duration};

use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, time::Instant};

use comms_if::eqpt::{act::ActCmd, cam::CamId, EqptError};
use util::raise_error;

use super::{
    loc::{transforms, ConvGuard, ConvergenceError, Pose},
    nav::{NavError, NavExec, PathPlanner},
    path::{PathError, Track, TurnDirection},
    per::{VisionParams, VisionRefiner},
    tool::{ToolOrchestrator, ToolResult},
    waypoint::WaypointSet,
};
use crate::{eqpt::Services, params::MissionExecParams};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Path of the checkpoint within the session.
pub const CHECKPOINT_PATH: &str = "mission/checkpoint.json";

/// Path of the end of mission summary within the session.
pub const SUMMARY_PATH: &str = "mission/summary.json";

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Mission Manager
///
/// Owns the mission progress and every autonomy component, and borrows the services only while
/// running.
pub struct MissionMgr<'w> {
    params: MissionMgrParams,

    waypoints: &'w WaypointSet,

    /// The ordered jobs of the mission
    jobs: Vec<Job>,

    planner: PathPlanner,

    conv_guard: ConvGuard,

    nav: NavExec,

    vision: VisionParams,

    refiner: VisionRefiner,

    tool: ToolOrchestrator,

    /// Pose of the probe tip in the robot frame
    robot_from_tool: Pose,

    state: MissionState,

    records: Vec<WaypointRecord>,

    /// Working data of the current job, cleared between jobs
    job_data: JobData,

    subscribers: Vec<mpsc::UnboundedSender<Transition>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MissionMgrParams {
    /// Number of times a failed stage is retried before the waypoint is skipped.
    pub max_stage_retries: usize,

    /// Number of waypoints which can be skipped before the mission fails.
    pub max_skips: usize,

    /// Maximum time to drive an approach track.
    pub approach_timeout_s: f64,

    /// Maximum time to drive a final track.
    pub execute_timeout_s: f64,

    /// Maximum time to drive a row turn.
    pub row_turn_timeout_s: f64,

    /// Maximum time for the whole tool sequence.
    pub deploy_timeout_s: f64,

    /// Distance between rows.
    pub row_spacing_m: f64,

    /// Direction of the turn at the end of the first row, turns alternate after that.
    pub first_turn: TurnDirection,

    /// Save a checkpoint to the session after every job.
    pub save_checkpoints: bool,
}

/// Everything needed to resume an interrupted mission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionCheckpoint {
    pub state: MissionState,

    pub records: Vec<WaypointRecord>,

    /// Generation id the next planned track should have
    pub next_generation: u64,
}

/// Counts of waypoint outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pending: usize,
}

/// Why a mission failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub stage: MissionMgrState,
    pub error: String,
}

/// Working data of a single job.
#[derive(Debug, Default)]
struct JobData {
    /// Surveyed pose of the hole
    hole: Option<Pose>,

    /// Hole pose refined by vision
    refined_hole: Option<Pose>,

    approach_track: Option<Track>,

    final_track: Option<Track>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Final outcome of a mission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MissionOutcome {
    Completed,

    FailedAt {
        waypoint_index: usize,
        reason: FailureReason,
    },
}

/// Errors which end a stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Localisation: {0}")]
    Convergence(#[from] ConvergenceError),

    #[error("Navigation: {0}")]
    Nav(#[from] NavError),

    #[error("Planning: {0}")]
    Path(#[from] PathError),

    #[error("Tool {0}")]
    Tool(ToolResult),

    #[error("Tool sequence did not finish within {0:.1} s")]
    ToolTimeout(f64),

    #[error("Equipment: {0}")]
    Eqpt(#[from] EqptError),
}

/// Errors raised when setting up a mission.
#[derive(Debug, thiserror::Error)]
pub enum MissionError {
    #[error("Could not read the checkpoint: {0}")]
    CheckpointIo(#[from] std::io::Error),

    #[error("Could not parse the checkpoint: {0}")]
    CheckpointParse(#[from] serde_json::Error),

    #[error("Checkpoint has {found} waypoint records but the mission has {expected} waypoints")]
    CheckpointMismatch { expected: usize, found: usize },

    #[error("The checkpointed mission had already finished")]
    AlreadyFinished,
}

/// Result of a successful stage.
enum StepOutput {
    /// Move on to the given state
    Next(MissionMgrState),

    /// The job is done
    JobDone,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl MissionMgrParams {
    fn approach_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.approach_timeout_s)
    }

    fn execute_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.execute_timeout_s)
    }

    fn row_turn_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.row_turn_timeout_s)
    }

    fn deploy_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.deploy_timeout_s)
    }
}

impl<'w> MissionMgr<'w> {
    /// Build a new mission over the given waypoints.
    pub fn new(params: &MissionExecParams, waypoints: &'w WaypointSet) -> Self {
        let jobs = build_jobs(waypoints, params.mission.first_turn);
        let records = (0..waypoints.len()).map(WaypointRecord::new).collect();

        Self {
            params: params.mission.clone(),
            waypoints,
            jobs,
            planner: PathPlanner::new(params.planner.clone()),
            conv_guard: ConvGuard::new(params.conv_guard.clone()),
            nav: NavExec::new(params.nav.clone()),
            vision: params.vision.clone(),
            refiner: VisionRefiner::new(
                CamId::Forward,
                params.vision.forward_cam.calib.clone(),
                params.vision.search_radius_m,
            ),
            tool: ToolOrchestrator::from_params(&params.tool),
            robot_from_tool: transforms::robot_from_tool(params.tool.probe_offset_m_rb),
            state: MissionState::new(),
            records,
            job_data: JobData::default(),
            subscribers: Vec::new(),
        }
    }

    /// Rebuild a mission from a checkpoint, continuing from the job which was in progress.
    pub fn resume(
        params: &MissionExecParams,
        waypoints: &'w WaypointSet,
        checkpoint: MissionCheckpoint,
    ) -> Result<Self, MissionError> {
        let mut mgr = Self::new(params, waypoints);

        if checkpoint.records.len() != waypoints.len() {
            return Err(MissionError::CheckpointMismatch {
                expected: waypoints.len(),
                found: checkpoint.records.len(),
            });
        }

        if checkpoint.state.job_index >= mgr.jobs.len() {
            return Err(MissionError::AlreadyFinished);
        }

        mgr.planner = PathPlanner::new(params.planner.clone())
            .with_first_generation(checkpoint.next_generation);
        mgr.records = checkpoint.records;
        mgr.state = MissionState {
            lifecycle: MissionMgrState::Idle,
            retries: 0,
            stage_started: None,
            ..checkpoint.state
        };

        let finished = mgr.records.iter().filter(|r| r.is_finished()).count();
        info!(
            "Resuming mission at {} ({}/{} waypoints finished, {} skips used)",
            mgr.current_job(),
            finished,
            waypoints.len(),
            mgr.state.skips
        );

        Ok(mgr)
    }

    /// Subscribe to the state transitions of the mission.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Transition> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn state(&self) -> &MissionState {
        &self.state
    }

    pub fn records(&self) -> &[WaypointRecord] {
        &self.records
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Count the waypoint outcomes.
    pub fn summary(&self) -> MissionSummary {
        let mut summary = MissionSummary::default();
        for record in self.records.iter() {
            match record.status {
                WaypointStatus::Completed => summary.completed += 1,
                WaypointStatus::Skipped => summary.skipped += 1,
                WaypointStatus::Failed => summary.failed += 1,
                WaypointStatus::Pending | WaypointStatus::InProgress => summary.pending += 1,
            }
        }
        summary
    }

    pub fn checkpoint(&self) -> MissionCheckpoint {
        MissionCheckpoint {
            state: self.state.clone(),
            records: self.records.clone(),
            next_generation: self.planner.next_generation(),
        }
    }

    /// Run the mission to completion or failure.
    pub async fn run(&mut self, services: &mut Services) -> MissionOutcome {
        self.state.stage_started = Some(Instant::now());

        if let Err(error) = self.prepare(services).await {
            error!("Could not start the mission: {}", error);
            return self.fail(MissionMgrState::Idle, error);
        }

        if self.jobs.get(self.state.job_index).is_none() {
            self.transition(MissionMgrState::Complete);
            return self.finish(services, MissionOutcome::Completed).await;
        }

        self.start_job();
        self.transition(MissionMgrState::Planning);

        loop {
            let job = self.current_job();
            let stage = self.state.lifecycle;

            let outcome = match self.step(stage, job, services).await {
                Ok(StepOutput::Next(next)) => {
                    self.transition(next);
                    None
                }
                Ok(StepOutput::JobDone) => {
                    self.finish_job(job);
                    self.advance()
                }
                Err(error) => self.recover(stage, job, error, services).await,
            };

            if let Some(outcome) = outcome {
                return self.finish(services, outcome).await;
            }
        }
    }

    /// Bring the services up and get the tool ready.
    async fn prepare(&mut self, services: &mut Services) -> Result<(), String> {
        services.init().await.map_err(|e| e.to_string())?;

        let ready = self.tool.verify_ready(stages::tool_eqpt(services)).await;
        if !ready.success {
            return Err(format!("tool not ready, {}", ready));
        }

        let calibrated = self.tool.calibrate(stages::tool_eqpt(services)).await;
        if !calibrated.success {
            return Err(format!("tool calibration {}", calibrated));
        }

        info!(
            "Mission ready: {} waypoints, {} jobs, {} tool",
            self.waypoints.len(),
            self.jobs.len(),
            self.tool.name()
        );
        Ok(())
    }

    /// Run a single stage of the current job.
    async fn step(
        &mut self,
        stage: MissionMgrState,
        job: Job,
        services: &mut Services,
    ) -> Result<StepOutput, StageError> {
        match stage {
            MissionMgrState::Planning => self.plan(job, services).await,
            MissionMgrState::Approaching => self.approach(services).await,
            MissionMgrState::Detecting => self.detect(services).await,
            MissionMgrState::Refining => self.refine(services).await,
            MissionMgrState::Executing => self.execute(job, services).await,
            MissionMgrState::Deploying => self.deploy(services).await,
            s => raise_error!("The mission cannot step the {} state", s),
        }
    }

    /// Handle a stage failure, returning the outcome of the mission if it has ended.
    async fn recover(
        &mut self,
        stage: MissionMgrState,
        job: Job,
        error: StageError,
        services: &mut Services,
    ) -> Option<MissionOutcome> {
        warn!("{} failed during {}: {}", job, stage, error);
        self.transition(MissionMgrState::Recovering);

        // Make sure nothing is left driving
        self.nav.cancel(services.follower.as_mut()).await;

        let failure = StageFailure {
            stage,
            error: error.to_string(),
        };
        if let Some(record) = self.records.get_mut(job.waypoint_index()) {
            if let Job::Waypoint(_) = job {
                record.attempts = self.state.retries + 1;
            }
            record.failures.push(failure.clone());
        }

        if let StageError::Nav(NavError::TrackActive { .. }) = error {
            error!("Attempted to submit over an active track, aborting the mission");
            return Some(self.fail(stage, failure.error));
        }

        if self.state.retries < self.params.max_stage_retries {
            self.state.retries += 1;
            let retry = retry_stage(stage, job);
            info!(
                "Retrying {} from {} ({}/{})",
                job, retry, self.state.retries, self.params.max_stage_retries
            );
            self.transition(retry);
            return None;
        }

        match job {
            Job::Waypoint(i) if self.state.skips < self.params.max_skips => {
                self.state.skips += 1;
                warn!(
                    "Skipping waypoint {} after {} retries ({}/{} skips)",
                    i, self.state.retries, self.state.skips, self.params.max_skips
                );
                self.finish_record(i, WaypointStatus::Skipped);
                self.advance()
            }
            _ => {
                error!("Out of retries and skips for {}", job);
                Some(self.fail(stage, failure.error))
            }
        }
    }

    /// Mark the current job as done.
    fn finish_job(&mut self, job: Job) {
        match job {
            Job::Waypoint(i) => {
                info!("Waypoint {} complete", i);
                self.finish_record(i, WaypointStatus::Completed);
            }
            Job::RowTurn { .. } => {
                self.state.row_index += 1;
                info!("Now on row {}", self.state.row_index);
            }
        }
    }

    /// Move on to the next job, returning the outcome if there are none left.
    fn advance(&mut self) -> Option<MissionOutcome> {
        self.state.job_index += 1;
        self.state.retries = 0;
        self.job_data = JobData::default();

        if self.state.job_index >= self.jobs.len() {
            self.save_checkpoint();
            self.transition(MissionMgrState::Complete);
            return Some(MissionOutcome::Completed);
        }

        self.start_job();
        self.save_checkpoint();
        self.transition(MissionMgrState::Planning);
        None
    }

    /// Set up the progress record for the current job.
    fn start_job(&mut self) {
        let job = self.current_job();
        self.state.waypoint_index = job.waypoint_index();

        if let Job::Waypoint(i) = job {
            if let Some(wp) = self.waypoints.get(i) {
                self.state.row_index = wp.row;
            }
            if let Some(record) = self.records.get_mut(i) {
                record.status = WaypointStatus::InProgress;
                record.attempts = 1;
            }
        }
    }

    fn finish_record(&mut self, index: usize, status: WaypointStatus) {
        if let Some(record) = self.records.get_mut(index) {
            record.status = status;
            record.attempts = self.state.retries + 1;
            record.finished_at = Some(Utc::now());
        }
    }

    /// End the mission in the failed state.
    fn fail(&mut self, stage: MissionMgrState, error: String) -> MissionOutcome {
        let job = self.current_job();
        let waypoint_index = job.waypoint_index();

        if let Job::Waypoint(i) = job {
            self.finish_record(i, WaypointStatus::Failed);
        }

        self.transition(MissionMgrState::Failed);
        self.save_checkpoint();

        MissionOutcome::FailedAt {
            waypoint_index,
            reason: FailureReason { stage, error },
        }
    }

    /// Leave the robot safe and report the mission outcome.
    async fn finish(&mut self, services: &mut Services, outcome: MissionOutcome) -> MissionOutcome {
        self.nav.cancel(services.follower.as_mut()).await;
        if let Err(e) = services.act.send(ActCmd::stop()).await {
            warn!("Could not send the final stop: {}", e);
        }

        let summary = self.summary();
        match &outcome {
            MissionOutcome::Completed => info!("Mission complete"),
            MissionOutcome::FailedAt {
                waypoint_index,
                reason,
            } => error!(
                "Mission failed at waypoint {} during {}: {}",
                waypoint_index, reason.stage, reason.error
            ),
        }
        info!(
            "Waypoints: {} completed, {} skipped, {} failed, {} pending",
            summary.completed, summary.skipped, summary.failed, summary.pending
        );

        if self.params.save_checkpoints {
            util::session::save(SUMMARY_PATH, summary);
        }

        outcome
    }

    /// Change lifecycle state, logging and publishing the transition.
    fn transition(&mut self, to: MissionMgrState) {
        let from = self.state.lifecycle;
        let job = self.current_job();
        let elapsed_s = self.state.stage_elapsed_s();

        info!("[STATE] {} -> {} ({}, {:.1} s)", from, to, job, elapsed_s);

        self.state.lifecycle = to;
        self.state.stage_started = Some(Instant::now());

        let transition = Transition {
            from,
            to,
            job,
            elapsed_s,
            timestamp: Utc::now(),
        };
        self.subscribers
            .retain(|tx| tx.send(transition.clone()).is_ok());
    }

    fn save_checkpoint(&self) {
        if self.params.save_checkpoints {
            util::session::save(CHECKPOINT_PATH, self.checkpoint());
        }
    }

    /// The job being worked on, or the last job once they are all done.
    fn current_job(&self) -> Job {
        self.jobs
            .get(self.state.job_index)
            .or_else(|| self.jobs.last())
            .copied()
            .unwrap_or(Job::Waypoint(0))
    }
}

impl MissionCheckpoint {
    /// Load a checkpoint saved by a previous session.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, MissionError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// Run a mission over the given waypoints, shutting the services down at the end.
pub async fn run_mission(
    waypoints: &WaypointSet,
    params: &MissionExecParams,
    services: &mut Services,
) -> MissionOutcome {
    let mut mgr = MissionMgr::new(params, waypoints);
    let outcome = mgr.run(services).await;
    services.shutdown().await;
    outcome
}

/// Lay out the jobs of a mission, with a row turn after each row but the last.
fn build_jobs(waypoints: &WaypointSet, first_turn: TurnDirection) -> Vec<Job> {
    let mut jobs = Vec::with_capacity(waypoints.len() + waypoints.num_rows());
    let mut direction = first_turn;

    for wp in waypoints.iter() {
        jobs.push(Job::Waypoint(wp.index));

        if wp.is_last_in_row() && wp.index + 1 < waypoints.len() {
            jobs.push(Job::RowTurn {
                after: wp.index,
                direction,
            });
            direction = direction.opposite();
        }
    }

    jobs
}

/// The state a failed stage is retried from.
///
/// Stages which moved the robot are retried by replanning from where it ended up. A failed tool
/// sequence may have moved the robot off the hole, so it drives back onto the hole first. A row
/// turn is replanned in full.
fn retry_stage(stage: MissionMgrState, job: Job) -> MissionMgrState {
    match (job, stage) {
        (Job::RowTurn { .. }, _) => MissionMgrState::Planning,
        (_, MissionMgrState::Deploying) => MissionMgrState::Executing,
        (_, s) => s,
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::{auto::waypoint::SurveyPoint, params::test_params, sim_client::SimWorld};
    use comms_if::eqpt::act::{AckResponse, CommandId};

    fn waypoints(n: usize, row_length: Option<usize>) -> WaypointSet {
        let points: Vec<_> = (0..n)
            .map(|i| SurveyPoint {
                dx: 0.0,
                dy: 2.0 * i as f64,
                yaw_deg: None,
                row: None,
            })
            .collect();
        WaypointSet::from_survey(&points, row_length).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Transition>) -> Vec<Transition> {
        let mut out = Vec::new();
        while let Ok(t) = rx.try_recv() {
            out.push(t);
        }
        out
    }

    #[test]
    fn test_build_jobs() {
        let set = waypoints(5, Some(2));
        let jobs = build_jobs(&set, TurnDirection::Left);

        assert_eq!(
            jobs,
            vec![
                Job::Waypoint(0),
                Job::Waypoint(1),
                Job::RowTurn {
                    after: 1,
                    direction: TurnDirection::Left
                },
                Job::Waypoint(2),
                Job::Waypoint(3),
                Job::RowTurn {
                    after: 3,
                    direction: TurnDirection::Right
                },
                Job::Waypoint(4),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_planning_count_and_order() {
        let world = SimWorld::default();
        let mut services = world.services();
        let params = test_params();
        let set = waypoints(4, Some(2));

        let mut mgr = MissionMgr::new(&params, &set);
        let mut rx = mgr.subscribe();
        let outcome = mgr.run(&mut services).await;
        assert_eq!(outcome, MissionOutcome::Completed);

        let transitions = drain(&mut rx);

        // One planning per waypoint and per row turn
        let planning = transitions
            .iter()
            .filter(|t| t.to == MissionMgrState::Planning)
            .count();
        assert_eq!(planning, 4 + 1);

        // Never goes backwards within a job
        for t in transitions.iter() {
            if let (Some(from), Some(to)) = (t.from.order(), t.to.order()) {
                if t.to != MissionMgrState::Planning {
                    assert!(to > from, "Backward transition {} -> {}", t.from, t.to);
                }
            }
        }

        assert_eq!(
            mgr.summary(),
            MissionSummary {
                completed: 4,
                ..Default::default()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_failure_retries_then_skips() {
        let world = SimWorld::default();
        world.push_ack(CommandId::ProbeDeploy, AckResponse::Negative);
        world.push_ack(CommandId::ProbeDeploy, AckResponse::Negative);
        world.push_ack(CommandId::ProbeDeploy, AckResponse::Negative);
        let mut services = world.services();

        let mut params = test_params();
        params.mission.max_stage_retries = 2;
        params.mission.max_skips = 1;
        let set = waypoints(2, None);

        let mut mgr = MissionMgr::new(&params, &set);
        let outcome = mgr.run(&mut services).await;
        assert_eq!(outcome, MissionOutcome::Completed);

        let records = mgr.records();
        assert_eq!(records[0].status, WaypointStatus::Skipped);
        assert_eq!(records[0].attempts, 3);
        assert_eq!(records[0].failures.len(), 3);
        assert!(records[0]
            .failures
            .iter()
            .all(|f| f.stage == MissionMgrState::Deploying));
        assert_eq!(records[1].status, WaypointStatus::Completed);
        assert_eq!(records[1].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_once_skips_exhausted() {
        let world = SimWorld::default();
        world.set_ack_default(CommandId::ProbeDeploy, AckResponse::Negative);
        let mut services = world.services();

        let mut params = test_params();
        params.mission.max_stage_retries = 0;
        params.mission.max_skips = 1;
        let set = waypoints(3, None);

        let mut mgr = MissionMgr::new(&params, &set);
        let mut rx = mgr.subscribe();
        let outcome = mgr.run(&mut services).await;

        match outcome {
            MissionOutcome::FailedAt {
                waypoint_index,
                reason,
            } => {
                assert_eq!(waypoint_index, 1);
                assert_eq!(reason.stage, MissionMgrState::Deploying);
            }
            o => panic!("Expected failure, got {:?}", o),
        }

        assert_eq!(mgr.records()[0].status, WaypointStatus::Skipped);
        assert_eq!(mgr.records()[1].status, WaypointStatus::Failed);
        assert_eq!(mgr.records()[2].status, WaypointStatus::Pending);

        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(last.to, MissionMgrState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_divergence_fails_planning() {
        let world = SimWorld::default();
        world.set_converge_after_rotations(None);
        let mut services = world.services();

        let mut params = test_params();
        params.mission.max_stage_retries = 1;
        params.mission.max_skips = 0;
        params.conv_guard.max_retries = 2;
        let set = waypoints(1, None);

        let mut mgr = MissionMgr::new(&params, &set);
        let outcome = mgr.run(&mut services).await;

        assert!(matches!(
            outcome,
            MissionOutcome::FailedAt {
                waypoint_index: 0,
                reason: FailureReason {
                    stage: MissionMgrState::Planning,
                    ..
                }
            }
        ));

        // Two wiggles per attempt, two attempts
        assert_eq!(world.rotations().len(), 4);

        // Nothing was driven
        assert!(world.submitted_tracks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_approach_retry_replans() {
        let world = SimWorld::default();
        world.fail_next_tracks(1);
        let mut services = world.services();
        let params = test_params();
        let set = waypoints(1, None);

        let mut mgr = MissionMgr::new(&params, &set);
        let outcome = mgr.run(&mut services).await;
        assert_eq!(outcome, MissionOutcome::Completed);

        // Failed approach, replanned approach, final track
        let tracks = world.submitted_tracks();
        assert_eq!(tracks.len(), 3);
        let generations: Vec<_> = tracks.iter().map(|t| t.generation).collect();
        assert!(generations.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(mgr.records()[0].failures[0].stage, MissionMgrState::Approaching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_from_checkpoint() {
        let world = SimWorld::default();
        let mut services = world.services();
        let params = test_params();
        let set = waypoints(3, None);

        let mut checkpoint = MissionMgr::new(&params, &set).checkpoint();
        checkpoint.state.job_index = 2;
        checkpoint.state.waypoint_index = 2;
        checkpoint.records[0].status = WaypointStatus::Completed;
        checkpoint.records[1].status = WaypointStatus::Skipped;
        checkpoint.state.skips = 1;
        checkpoint.next_generation = 10;

        let mut mgr = MissionMgr::resume(&params, &set, checkpoint).unwrap();
        let outcome = mgr.run(&mut services).await;
        assert_eq!(outcome, MissionOutcome::Completed);

        assert_eq!(
            mgr.summary(),
            MissionSummary {
                completed: 2,
                skipped: 1,
                ..Default::default()
            }
        );

        // Only the last waypoint was visited, continuing the track numbering
        let tracks = world.submitted_tracks();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].generation, 10);
    }

    #[test]
    fn test_resume_rejects_bad_checkpoints() {
        let params = test_params();
        let set = waypoints(2, None);

        let mut checkpoint = MissionMgr::new(&params, &set).checkpoint();
        checkpoint.records.pop();
        assert!(matches!(
            MissionMgr::resume(&params, &set, checkpoint),
            Err(MissionError::CheckpointMismatch {
                expected: 2,
                found: 1
            })
        ));

        let mut checkpoint = MissionMgr::new(&params, &set).checkpoint();
        checkpoint.state.job_index = 2;
        assert!(matches!(
            MissionMgr::resume(&params, &set, checkpoint),
            Err(MissionError::AlreadyFinished)
        ));
    }

    #[test]
    fn test_checkpoint_json() {
        let params = test_params();
        let set = waypoints(2, None);
        let checkpoint = MissionMgr::new(&params, &set).checkpoint();

        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: MissionCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back.records.len(), 2);
        assert_eq!(back.state.lifecycle, MissionMgrState::Idle);
    }
}
