//! Stage functions of the [`MissionMgr`]
//!
//! Each stage does its work and returns the state to move to, or an error which sends the
//! mission into recovery. Every stage which uses the robot pose asks the convergence guard for it
//! first, so nothing is ever planned or projected from a stale or unconverged pose.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{info, warn};

use comms_if::eqpt::act::ActCmd;
use util::raise_error;

use super::{Job, JobData, MissionMgr, MissionMgrState, StageError, StepOutput};
use crate::{
    auto::{
        loc::{transforms::robot_target, Pose},
        per::RefinedTarget,
        tool::ToolEqpt,
    },
    eqpt::Services,
};

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<'w> MissionMgr<'w> {
    /// Ensure convergence and plan the first track of the job.
    pub(super) async fn plan(
        &mut self,
        job: Job,
        services: &mut Services,
    ) -> Result<StepOutput, StageError> {
        let current = self.conv_guard.ensure(services.loc.as_mut()).await?;

        match job {
            Job::Waypoint(i) => {
                let hole = match self.waypoints.get(i) {
                    Some(wp) => wp.hole_pose(),
                    None => raise_error!("Job refers to waypoint {} which doesn't exist", i),
                };
                let target = robot_target(&hole, &self.robot_from_tool);
                let track = self.planner.plan_approach(&current, &target)?;

                self.job_data = JobData {
                    hole: Some(hole),
                    approach_track: Some(track),
                    ..Default::default()
                };

                Ok(StepOutput::Next(MissionMgrState::Approaching))
            }
            Job::RowTurn { direction, .. } => {
                let track =
                    self.planner
                        .plan_row_turn(&current, self.params.row_spacing_m, direction)?;

                self.job_data = JobData {
                    final_track: Some(track),
                    ..Default::default()
                };

                Ok(StepOutput::Next(MissionMgrState::Executing))
            }
        }
    }

    /// Drive to the search zone of the hole.
    pub(super) async fn approach(
        &mut self,
        services: &mut Services,
    ) -> Result<StepOutput, StageError> {
        let track = match self.job_data.approach_track.take() {
            Some(t) => t,
            None => {
                // Retrying, start from wherever the last attempt left the robot
                let current = self.conv_guard.ensure(services.loc.as_mut()).await?;
                let target = robot_target(&self.planned_hole(), &self.robot_from_tool);
                self.planner.plan_approach(&current, &target)?
            }
        };

        self.nav
            .execute(
                services.follower.as_mut(),
                track,
                self.params.approach_timeout(),
            )
            .await?;

        if self.vision.enabled {
            Ok(StepOutput::Next(MissionMgrState::Detecting))
        } else {
            Ok(StepOutput::Next(MissionMgrState::Executing))
        }
    }

    /// Look for the hole with the forward camera.
    ///
    /// Failing to find the hole is not an error, the planned position is used instead.
    pub(super) async fn detect(
        &mut self,
        services: &mut Services,
    ) -> Result<StepOutput, StageError> {
        let current = self.conv_guard.ensure(services.loc.as_mut()).await?;
        let planned = self.planned_hole();

        let refined = self.look_for_hole(&current, &planned, services).await;

        if refined.valid {
            self.job_data.refined_hole = Some(refined.pose);
            Ok(StepOutput::Next(MissionMgrState::Refining))
        } else {
            info!("Hole not refined, falling back to the surveyed position");
            self.job_data.refined_hole = None;
            Ok(StepOutput::Next(MissionMgrState::Executing))
        }
    }

    /// Plan the final track onto the refined hole.
    pub(super) async fn refine(
        &mut self,
        services: &mut Services,
    ) -> Result<StepOutput, StageError> {
        let current = self.conv_guard.ensure(services.loc.as_mut()).await?;

        if self.vision.confirmation_pass {
            let planned = self.planned_hole();
            let confirmed = self.look_for_hole(&current, &planned, services).await;

            if confirmed.valid {
                self.job_data.refined_hole = Some(confirmed.pose);
            } else {
                warn!("Confirmation pass lost the hole, falling back to the surveyed position");
                self.job_data.refined_hole = None;
            }
        }

        let target = robot_target(&self.best_hole(), &self.robot_from_tool);
        let track = self.planner.plan_refinement(&current, &target)?;
        self.job_data.final_track = Some(track);

        Ok(StepOutput::Next(MissionMgrState::Executing))
    }

    /// Drive the final track of the job.
    pub(super) async fn execute(
        &mut self,
        job: Job,
        services: &mut Services,
    ) -> Result<StepOutput, StageError> {
        let track = match self.job_data.final_track.take() {
            Some(t) => t,
            None => {
                let current = self.conv_guard.ensure(services.loc.as_mut()).await?;
                let target = robot_target(&self.best_hole(), &self.robot_from_tool);
                self.planner.plan_refinement(&current, &target)?
            }
        };

        let timeout = match job {
            Job::Waypoint(_) => self.params.execute_timeout(),
            Job::RowTurn { .. } => self.params.row_turn_timeout(),
        };

        self.nav
            .execute(services.follower.as_mut(), track, timeout)
            .await?;

        match job {
            Job::Waypoint(_) => Ok(StepOutput::Next(MissionMgrState::Deploying)),
            Job::RowTurn { .. } => Ok(StepOutput::JobDone),
        }
    }

    /// Run the tool sequence over the hole.
    pub(super) async fn deploy(
        &mut self,
        services: &mut Services,
    ) -> Result<StepOutput, StageError> {
        let hole = self.best_hole();
        let timeout = self.params.deploy_timeout();

        let result =
            tokio::time::timeout(timeout, self.tool.deploy(&hole, tool_eqpt(services))).await;

        match result {
            Ok(r) if r.success => Ok(StepOutput::JobDone),
            Ok(r) => Err(StageError::Tool(r)),
            Err(_) => {
                // The sequence was cut short, make sure the chute is shut and the base stopped
                for cmd in [ActCmd::Dispenser { open: false }, ActCmd::stop()] {
                    if let Err(e) = services.act.send(cmd).await {
                        warn!("Could not send {:?} after tool timeout: {}", cmd, e);
                    }
                }
                Err(StageError::ToolTimeout(timeout.as_secs_f64()))
            }
        }
    }

    /// Run a detection pass with the forward camera.
    async fn look_for_hole(
        &self,
        world_from_robot: &Pose,
        planned: &Pose,
        services: &mut Services,
    ) -> RefinedTarget {
        let detections = match services.cam.detections(self.refiner.cam_id()).await {
            Ok(d) => d,
            Err(e) => {
                warn!("Could not subscribe to {} detections: {}", self.refiner.cam_id(), e);
                return RefinedTarget::invalid(planned);
            }
        };

        self.refiner
            .refine(
                detections,
                world_from_robot,
                planned,
                self.vision.timeout(),
                self.vision.forward_cam.min_confidence,
                self.vision.forward_cam.sample_count,
            )
            .await
    }

    /// Surveyed pose of the current job's hole.
    fn planned_hole(&self) -> Pose {
        match self.job_data.hole {
            Some(h) => h,
            None => raise_error!("No hole has been planned for the current job"),
        }
    }

    /// Refined pose of the current job's hole if there is one, otherwise the surveyed one.
    fn best_hole(&self) -> Pose {
        self.job_data
            .refined_hole
            .unwrap_or_else(|| self.planned_hole())
    }
}

/// Borrow the equipment the tool is allowed to drive.
pub(super) fn tool_eqpt(services: &mut Services) -> ToolEqpt<'_> {
    ToolEqpt {
        act: services.act.as_mut(),
        cam: services.cam.as_mut(),
    }
}
