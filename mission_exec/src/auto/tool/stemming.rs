//! # Stemming tool
//!
//! Stemming fills a charged blast hole with aggregate. At each hole the sequence is:
//!
//! 1. Check the probe is over the hole using the downward camera.
//! 2. Deploy the depth probe and wait for it to acknowledge.
//! 3. Drive forward by the probe to dispenser offset so the chute is over the hole.
//! 4. Optionally check the alignment again. This only warns, the chute is over the hole by
//!    construction so dispensing goes ahead either way.
//! 5. Pulse the dispenser chute.
//!
//! The first failing step ends the sequence.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::time::Instant;

use comms_if::eqpt::{
    act::{AckResponse, ActCmd},
    cam::CamId,
    EqptError,
};

use super::{ToolEqpt, ToolError, ToolStage};
use crate::eqpt::{ActClient, CamClient};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct StemmingTool {
    params: StemmingParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StemmingParams {
    /// Maximum distance between the tool and the hole centre.
    pub alignment_tolerance_m: f64,

    /// Width of ground seen by the downward camera at the hole.
    pub alignment_footprint_m: f64,

    /// Minimum confidence of an alignment detection.
    pub alignment_min_confidence: f64,

    /// Maximum time to wait for an alignment detection.
    pub alignment_timeout_s: f64,

    /// Repeat the alignment check once the dispenser is over the hole.
    pub secondary_alignment: bool,

    /// Maximum time to wait for the probe to acknowledge deployment.
    pub ack_timeout_s: f64,

    /// Maximum time to wait for any command to be accepted by the actuator service.
    pub command_timeout_s: f64,

    /// Distance to drive forward to bring the dispenser over the probed hole.
    pub probe_to_dispenser_m: f64,

    /// Speed of the forward translation.
    pub translate_speed_ms: f64,

    /// Time to wait after the translation before dispensing.
    pub dispense_settle_s: f64,

    /// Time the chute is held open in each pulse.
    pub pulse_open_s: f64,

    /// Time the chute is held closed between pulses.
    pub pulse_close_s: f64,

    /// Number of dispenser pulses per hole.
    pub pulse_count: usize,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl StemmingTool {
    pub fn new(params: StemmingParams) -> Self {
        Self { params }
    }

    /// Close the chute and confirm the actuator acknowledges it.
    pub async fn verify_ready(&mut self, eqpt: ToolEqpt<'_>) -> Result<(), ToolError> {
        self.send_acked(eqpt.act, ActCmd::Dispenser { open: false })
            .await
    }

    /// Cycle the chute once with acknowledgements, leaving it closed.
    pub async fn calibrate(&mut self, eqpt: ToolEqpt<'_>) -> Result<(), ToolError> {
        self.send_acked(eqpt.act, ActCmd::Dispenser { open: true })
            .await?;
        self.send_acked(eqpt.act, ActCmd::Dispenser { open: false })
            .await
    }

    /// Run the stemming sequence, returning the stage which failed if any.
    pub async fn execute(&mut self, eqpt: ToolEqpt<'_>) -> Result<(), (ToolStage, ToolError)> {
        let ToolEqpt { act, cam } = eqpt;

        self.check_alignment(cam)
            .await
            .map_err(|e| (ToolStage::Alignment, e))?;

        self.deploy_probe(act)
            .await
            .map_err(|e| (ToolStage::ProbeDeploy, e))?;

        self.translate(act)
            .await
            .map_err(|e| (ToolStage::Translate, e))?;

        if self.params.secondary_alignment {
            self.check_secondary_alignment(cam).await;
        }

        self.dispense(act)
            .await
            .map_err(|e| (ToolStage::Dispense, e))?;

        info!("Stemming complete");
        Ok(())
    }

    /// Compare the hole position in the downward camera against the tolerance.
    async fn check_alignment(&self, cam: &mut dyn CamClient) -> Result<(), ToolError> {
        let error_m = self.measure_alignment(cam).await?;

        if error_m > self.params.alignment_tolerance_m {
            return Err(ToolError::AlignmentFailed {
                error_m,
                tolerance_m: self.params.alignment_tolerance_m,
            });
        }

        debug!("Aligned to within {:.3} m", error_m);
        Ok(())
    }

    /// Repeat the alignment check with the chute over the hole, warning if it is off.
    async fn check_secondary_alignment(&self, cam: &mut dyn CamClient) {
        match self.check_alignment(cam).await {
            Ok(()) => (),
            Err(e) => warn!("Chute alignment suboptimal ({}), proceeding anyway", e),
        }
    }

    /// Distance between the image centre and the first confident hole detection, in meters on
    /// the ground.
    async fn measure_alignment(&self, cam: &mut dyn CamClient) -> Result<f64, ToolError> {
        let mut detections = cam.detections(CamId::Downward).await?;
        let deadline =
            Instant::now() + Duration::from_secs_f64(self.params.alignment_timeout_s);

        loop {
            match tokio::time::timeout_at(deadline, detections.next()).await {
                Ok(Some(det))
                    if det.cam_id == CamId::Downward
                        && det.confidence >= self.params.alignment_min_confidence =>
                {
                    let (x, y) = det.bbox.centroid();
                    let ex = (x - 0.5) * self.params.alignment_footprint_m;
                    let ey = (y - 0.5) * self.params.alignment_footprint_m;
                    return Ok(ex.hypot(ey));
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return Err(ToolError::NoAlignmentDetection),
            }
        }
    }

    async fn deploy_probe(&self, act: &mut dyn ActClient) -> Result<(), ToolError> {
        info!("Deploying probe");
        self.send_acked(act, ActCmd::DeployProbe).await
    }

    /// Drive forward open loop until the dispenser is over the hole.
    async fn translate(&self, act: &mut dyn ActClient) -> Result<(), ToolError> {
        let dist_m = self.params.probe_to_dispenser_m;
        if dist_m.abs() < f64::EPSILON {
            return Ok(());
        }

        let speed_ms = self.params.translate_speed_ms.abs() * dist_m.signum();
        let duration = Duration::from_secs_f64(dist_m.abs() / speed_ms.abs());

        debug!("Translating {:.2} m to the dispenser", dist_m);
        self.send(
            act,
            ActCmd::Twist {
                linear_ms: speed_ms,
                angular_rads: 0.0,
            },
        )
        .await?;

        tokio::time::sleep(duration).await;

        self.send(act, ActCmd::stop()).await
    }

    /// Pulse the dispenser chute. The chute is always left closed.
    async fn dispense(&self, act: &mut dyn ActClient) -> Result<(), ToolError> {
        tokio::time::sleep(Duration::from_secs_f64(self.params.dispense_settle_s)).await;

        for pulse in 0..self.params.pulse_count {
            debug!("Dispenser pulse {}/{}", pulse + 1, self.params.pulse_count);

            if let Err(e) = self.send(act, ActCmd::Dispenser { open: true }).await {
                if let Err(close_err) = self.send(act, ActCmd::Dispenser { open: false }).await {
                    warn!("Could not close the chute after failed pulse: {}", close_err);
                }
                return Err(e);
            }
            tokio::time::sleep(Duration::from_secs_f64(self.params.pulse_open_s)).await;

            self.send(act, ActCmd::Dispenser { open: false }).await?;
            tokio::time::sleep(Duration::from_secs_f64(self.params.pulse_close_s)).await;
        }

        Ok(())
    }

    /// Send a command and require a positive acknowledgement.
    async fn send_acked(&self, act: &mut dyn ActClient, cmd: ActCmd) -> Result<(), ToolError> {
        self.send(act, cmd).await?;

        let id = cmd.id();
        let ack_timeout = Duration::from_secs_f64(self.params.ack_timeout_s);
        let limit = ack_timeout + Duration::from_secs_f64(self.params.command_timeout_s);

        match tokio::time::timeout(limit, act.await_ack(id, ack_timeout)).await {
            Ok(Ok(AckResponse::Positive)) => Ok(()),
            Ok(Ok(AckResponse::Negative)) => Err(ToolError::AckNegative(id)),
            Ok(Ok(AckResponse::None)) | Err(_) => Err(ToolError::AckTimeout(id)),
            Ok(Err(e)) => Err(ToolError::Eqpt(e)),
        }
    }

    async fn send(&self, act: &mut dyn ActClient, cmd: ActCmd) -> Result<(), ToolError> {
        let limit = Duration::from_secs_f64(self.params.command_timeout_s);
        match tokio::time::timeout(limit, act.send(cmd)).await {
            Ok(r) => r.map_err(ToolError::Eqpt),
            Err(_) => Err(ToolError::Eqpt(EqptError::Timeout)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        auto::{loc::transforms::robot_from_tool, per::CamCalibration},
        sim_client::{SimParams, SimWorld},
    };
    use comms_if::eqpt::act::CommandId;
    use nalgebra::Vector2;

    fn params() -> StemmingParams {
        StemmingParams {
            alignment_tolerance_m: 0.02,
            alignment_footprint_m: 0.5,
            alignment_min_confidence: 0.7,
            alignment_timeout_s: 2.0,
            secondary_alignment: false,
            ack_timeout_s: 5.0,
            command_timeout_s: 1.0,
            probe_to_dispenser_m: 0.4,
            translate_speed_ms: 0.2,
            dispense_settle_s: 2.0,
            pulse_open_s: 0.2,
            pulse_close_s: 0.3,
            pulse_count: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sequence() {
        let world = SimWorld::default();
        world.set_downward_offset(0.5, 0.5);
        let (mut act, mut cam) = (world.act_client(), world.cam_client());
        let mut tool = StemmingTool::new(params());

        tool.execute(ToolEqpt {
            act: &mut act,
            cam: &mut cam,
        })
        .await
        .unwrap();

        let cmds = world.sent_commands();
        assert_eq!(cmds[0], ActCmd::DeployProbe);
        assert_eq!(
            cmds[1],
            ActCmd::Twist {
                linear_ms: 0.2,
                angular_rads: 0.0
            }
        );
        assert_eq!(cmds[2], ActCmd::stop());

        let pulses: Vec<_> = cmds[3..].to_vec();
        assert_eq!(pulses.len(), 6);
        assert_eq!(pulses[0], ActCmd::Dispenser { open: true });
        assert_eq!(pulses[5], ActCmd::Dispenser { open: false });
    }

    #[tokio::test(start_paused = true)]
    async fn test_secondary_alignment_does_not_block_dispensing() {
        // The probe starts right over the hole, after the translation the hole is behind the
        // downward camera's footprint
        let sim = SimParams {
            start_position_m: [0.0, 0.0],
            start_heading_rad: 0.0,
            converge_after_rotations: Some(0),
            follower_speed_ms: 0.5,
            follower_turn_rate_rads: 0.5,
            follower_load_time_s: 0.5,
            hole_offset_m: [0.0, 0.0],
            downward_footprint_m: 0.5,
        };
        let calib = CamCalibration {
            width_px: 640.0,
            height_px: 480.0,
            fx_px: 500.0,
            fy_px: 500.0,
            cx_px: 320.0,
            cy_px: 240.0,
            position_m_rb: [0.3, 0.0, 1.0],
            pitch_down_rad: 0.5,
        };
        let world = SimWorld::from_params(
            &sim,
            &[Vector2::new(0.8, 0.0)],
            calib,
            robot_from_tool([0.8, 0.0, -0.5]),
        );
        let (mut act, mut cam) = (world.act_client(), world.cam_client());

        let mut tool = StemmingTool::new(StemmingParams {
            secondary_alignment: true,
            ..params()
        });

        tool.execute(ToolEqpt {
            act: &mut act,
            cam: &mut cam,
        })
        .await
        .unwrap();

        let cmds = world.sent_commands();
        assert_eq!(cmds[0], ActCmd::DeployProbe);
        let opens = cmds
            .iter()
            .filter(|c| **c == ActCmd::Dispenser { open: true })
            .count();
        assert_eq!(opens, 3);
        assert_eq!(cmds.last(), Some(&ActCmd::Dispenser { open: false }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_misaligned_never_deploys() {
        // 0.06 of a 0.5 m footprint is 3 cm, tolerance is 2 cm
        let world = SimWorld::default();
        world.set_downward_offset(0.56, 0.5);
        let (mut act, mut cam) = (world.act_client(), world.cam_client());
        let mut tool = StemmingTool::new(params());

        let res = tool
            .execute(ToolEqpt {
                act: &mut act,
                cam: &mut cam,
            })
            .await;

        match res {
            Err((ToolStage::Alignment, ToolError::AlignmentFailed { error_m, .. })) => {
                assert!((error_m - 0.03).abs() < 1e-9)
            }
            other => panic!("Expected alignment failure, got {:?}", other),
        }
        assert!(!world.sent_commands().contains(&ActCmd::DeployProbe));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout() {
        let world = SimWorld::default();
        world.set_downward_offset(0.5, 0.5);
        world.push_ack(CommandId::ProbeDeploy, AckResponse::None);
        let (mut act, mut cam) = (world.act_client(), world.cam_client());
        let mut tool = StemmingTool::new(params());

        let res = tool
            .execute(ToolEqpt {
                act: &mut act,
                cam: &mut cam,
            })
            .await;

        assert!(matches!(
            res,
            Err((
                ToolStage::ProbeDeploy,
                ToolError::AckTimeout(CommandId::ProbeDeploy)
            ))
        ));
        // Never moved on to the dispenser
        assert_eq!(world.sent_commands(), vec![ActCmd::DeployProbe]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_negative() {
        let world = SimWorld::default();
        world.set_downward_offset(0.5, 0.5);
        world.push_ack(CommandId::ProbeDeploy, AckResponse::Negative);
        let (mut act, mut cam) = (world.act_client(), world.cam_client());
        let mut tool = StemmingTool::new(params());

        let res = tool
            .execute(ToolEqpt {
                act: &mut act,
                cam: &mut cam,
            })
            .await;

        assert!(matches!(
            res,
            Err((ToolStage::ProbeDeploy, ToolError::AckNegative(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_alignment_detection() {
        let world = SimWorld::default();
        world.clear_downward();
        let (mut act, mut cam) = (world.act_client(), world.cam_client());
        let mut tool = StemmingTool::new(params());

        let res = tool
            .execute(ToolEqpt {
                act: &mut act,
                cam: &mut cam,
            })
            .await;

        assert!(matches!(
            res,
            Err((ToolStage::Alignment, ToolError::NoAlignmentDetection))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_and_calibrate() {
        let world = SimWorld::default();
        let (mut act, mut cam) = (world.act_client(), world.cam_client());
        let mut tool = StemmingTool::new(params());

        tool.verify_ready(ToolEqpt {
            act: &mut act,
            cam: &mut cam,
        })
        .await
        .unwrap();
        tool.calibrate(ToolEqpt {
            act: &mut act,
            cam: &mut cam,
        })
        .await
        .unwrap();

        let cmds = world.sent_commands();
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[2], ActCmd::Dispenser { open: false });
    }
}
