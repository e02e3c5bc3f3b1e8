//! # Perception module
//!
//! Refines the surveyed position of a hole using the detections from a camera. Detections are
//! collected from the camera stream until enough confident ones have arrived or time runs out,
//! averaged, and back-projected into the world frame using the camera calibration and the robot
//! pose.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod calib;

pub use calib::CamCalibration;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use log::{debug, info, trace, warn};
use nalgebra::Vector3;
use serde::Deserialize;
use tokio::time::Instant;

use comms_if::eqpt::cam::{CamId, Detection};

use super::loc::{Frame, Pose};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Refines target positions from camera detections.
#[derive(Debug, Clone)]
pub struct VisionRefiner {
    cam_id: CamId,

    calib: CamCalibration,

    search_radius_m: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisionParams {
    /// If false the detection stage is skipped and the surveyed position is used.
    pub enabled: bool,

    /// Run a second detection pass from the end of the approach before the final track.
    pub confirmation_pass: bool,

    /// Refined targets further than this from the surveyed position are rejected.
    pub search_radius_m: f64,

    /// Maximum time to spend collecting detections.
    pub timeout_s: f64,

    pub forward_cam: CamParams,
}

/// Detection thresholds and calibration of a single camera.
#[derive(Debug, Clone, Deserialize)]
pub struct CamParams {
    /// Detections with a confidence below this are ignored.
    pub min_confidence: f64,

    /// Number of confident detections to average.
    pub sample_count: usize,

    pub calib: CamCalibration,
}

/// A refined target position.
#[derive(Debug, Clone, Copy)]
pub struct RefinedTarget {
    /// The refined pose of the target in the world frame, only meaningful if `valid`.
    pub pose: Pose,

    /// Whether the refinement succeeded.
    pub valid: bool,

    /// Number of detections averaged into the pose.
    pub num_samples: usize,
}

/// Mean of a set of detections.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AveragedDetection {
    pub u_norm: f64,
    pub v_norm: f64,
    pub depth_m: Option<f64>,
    pub confidence: f64,
    pub num_samples: usize,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Reasons a refinement did not produce a valid target.
///
/// None of these are fatal, the mission falls back to the planned target.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VisionError {
    #[error("No detection above the confidence threshold was received")]
    NoDetection,

    #[error("Detections carry no depth, cannot locate the target")]
    NoDepth,

    #[error("Refined target is {distance_m:.2} m from the planned one, outside the search zone")]
    OutsideSearchZone { distance_m: f64 },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl VisionParams {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s)
    }
}

impl RefinedTarget {
    /// A failed refinement, carrying the fallback pose.
    pub fn invalid(fallback: &Pose) -> Self {
        Self {
            pose: *fallback,
            valid: false,
            num_samples: 0,
        }
    }

    /// The refined pose if valid, otherwise the given fallback.
    pub fn or(&self, fallback: &Pose) -> Pose {
        if self.valid {
            self.pose
        } else {
            *fallback
        }
    }
}

impl VisionRefiner {
    pub fn new(cam_id: CamId, calib: CamCalibration, search_radius_m: f64) -> Self {
        Self {
            cam_id,
            calib,
            search_radius_m,
        }
    }

    pub fn cam_id(&self) -> CamId {
        self.cam_id
    }

    /// Refine the position of `planned` from a stream of detections.
    ///
    /// Detections are consumed until `sample_count` of them have at least `min_confidence`, the
    /// stream ends, or `timeout` elapses. Whatever has been collected by then is averaged. The
    /// stream is dropped on return so no further detections are consumed.
    pub async fn refine<S>(
        &self,
        detections: S,
        world_from_robot: &Pose,
        planned: &Pose,
        timeout: Duration,
        min_confidence: f64,
        sample_count: usize,
    ) -> RefinedTarget
    where
        S: Stream<Item = Detection> + Unpin,
    {
        match self
            .try_refine(
                detections,
                world_from_robot,
                planned,
                timeout,
                min_confidence,
                sample_count,
            )
            .await
        {
            Ok(target) => target,
            Err(e) => {
                warn!("Vision refinement failed: {}", e);
                RefinedTarget::invalid(planned)
            }
        }
    }

    /// As [`VisionRefiner::refine`] but returning why the refinement failed.
    pub async fn try_refine<S>(
        &self,
        mut detections: S,
        world_from_robot: &Pose,
        planned: &Pose,
        timeout: Duration,
        min_confidence: f64,
        sample_count: usize,
    ) -> Result<RefinedTarget, VisionError>
    where
        S: Stream<Item = Detection> + Unpin,
    {
        let deadline = Instant::now() + timeout;
        let mut valid = Vec::with_capacity(sample_count);

        while valid.len() < sample_count {
            match tokio::time::timeout_at(deadline, detections.next()).await {
                Ok(Some(det)) => {
                    if det.cam_id != self.cam_id {
                        trace!("Ignoring detection from {:?}", det.cam_id);
                    } else if det.confidence < min_confidence {
                        trace!("Ignoring detection with confidence {:.2}", det.confidence);
                    } else {
                        valid.push(det);
                    }
                }
                Ok(None) => {
                    debug!("Detection stream ended");
                    break;
                }
                Err(_) => {
                    debug!(
                        "Detection collection timed out with {}/{} samples",
                        valid.len(),
                        sample_count
                    );
                    break;
                }
            }
        }
        drop(detections);

        let avg = average_detections(&valid).ok_or(VisionError::NoDetection)?;
        let depth_m = avg.depth_m.ok_or(VisionError::NoDepth)?;

        // Detection -> camera -> robot -> world
        let point_c = self.calib.pixel_to_camera(avg.u_norm, avg.v_norm, depth_m);
        let world_from_camera = world_from_robot.compose(&self.calib.robot_from_camera());
        let point_w = world_from_camera.transform_point(&point_c);

        // Only the position is observed, keep the planned attitude and height
        let pose = Pose {
            frame: Frame::World,
            body: planned.body,
            position_m: Vector3::new(point_w.x, point_w.y, planned.position_m.z),
            attitude_q: planned.attitude_q,
        };

        let distance_m = pose.distance2(planned);
        if distance_m > self.search_radius_m {
            return Err(VisionError::OutsideSearchZone { distance_m });
        }

        info!(
            "Refined target from {} detection(s) (mean confidence {:.2}), moved {:.3} m",
            avg.num_samples, avg.confidence, distance_m
        );

        Ok(RefinedTarget {
            pose,
            valid: true,
            num_samples: avg.num_samples,
        })
    }
}

/// Average the centroid, depth and confidence of a set of detections.
///
/// Depth is averaged over the detections which have one. Returns `None` if `detections` is empty.
pub fn average_detections(detections: &[Detection]) -> Option<AveragedDetection> {
    if detections.is_empty() {
        return None;
    }

    let n = detections.len() as f64;
    let (mut u, mut v, mut conf) = (0.0, 0.0, 0.0);
    let mut depths = Vec::new();

    for det in detections {
        let (x, y) = det.bbox.centroid();
        u += x;
        v += y;
        conf += det.confidence;
        if let Some(d) = det.depth_m.filter(|d| *d > 0.0) {
            depths.push(d);
        }
    }

    let depth_m = if depths.is_empty() {
        None
    } else {
        Some(depths.iter().sum::<f64>() / depths.len() as f64)
    };

    Some(AveragedDetection {
        u_norm: u / n,
        v_norm: v / n,
        depth_m,
        confidence: conf / n,
        num_samples: detections.len(),
    })
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use comms_if::eqpt::cam::BoundingBox;
    use futures_util::stream;
    use nalgebra::Vector2;

    fn det(x: f64, conf: f64, depth: Option<f64>) -> Detection {
        Detection {
            cam_id: CamId::Forward,
            timestamp: Utc::now(),
            class: String::from("hole"),
            confidence: conf,
            bbox: BoundingBox::centred_on(x, 0.5, 0.1, 0.1),
            depth_m: depth,
        }
    }

    fn refiner() -> VisionRefiner {
        VisionRefiner::new(
            CamId::Forward,
            CamCalibration {
                width_px: 640.0,
                height_px: 480.0,
                fx_px: 500.0,
                fy_px: 500.0,
                cx_px: 320.0,
                cy_px: 240.0,
                position_m_rb: [0.0, 0.0, 0.0],
                pitch_down_rad: 0.0,
            },
            0.5,
        )
    }

    #[test]
    fn test_average_detections() {
        assert!(average_detections(&[]).is_none());

        let avg = average_detections(&[
            det(0.4, 0.9, Some(2.0)),
            det(0.6, 0.7, None),
            det(0.5, 0.8, Some(4.0)),
        ])
        .unwrap();

        assert!((avg.u_norm - 0.5).abs() < 1e-12);
        assert!((avg.v_norm - 0.5).abs() < 1e-12);
        assert!((avg.confidence - 0.8).abs() < 1e-12);
        assert_eq!(avg.depth_m, Some(3.0));
        assert_eq!(avg.num_samples, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refine_ignores_low_confidence() {
        // The 0.2 detection would drag the centroid off to the left
        let dets = stream::iter(vec![
            det(0.5, 0.9, Some(3.0)),
            det(0.1, 0.2, Some(3.0)),
            det(0.5, 0.95, Some(3.0)),
        ]);

        let robot = Pose::planar(Frame::World, Frame::Robot, 0.0, 0.0, 0.0);
        let planned = Pose::planar(Frame::World, Frame::Hole, 3.1, 0.0, 0.0);

        let target = refiner()
            .refine(dets, &robot, &planned, Duration::from_secs(5), 0.5, 3)
            .await;

        // Stream ended with only two confident detections, both averaged
        assert!(target.valid);
        assert_eq!(target.num_samples, 2);
        assert!((target.pose.position2() - Vector2::new(3.0, 0.0)).norm() < 1e-9);
        assert_eq!(target.pose.body, Frame::Hole);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refine_times_out_with_partial_samples() {
        // One detection then nothing for ever
        let dets = stream::iter(vec![det(0.5, 0.9, Some(2.0))]).chain(stream::pending());

        let robot = Pose::planar(Frame::World, Frame::Robot, 0.0, 0.0, 0.0);
        let planned = Pose::planar(Frame::World, Frame::Hole, 2.0, 0.0, 0.0);

        let target = refiner()
            .refine(dets, &robot, &planned, Duration::from_secs(2), 0.5, 5)
            .await;

        assert!(target.valid);
        assert_eq!(target.num_samples, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refine_no_detection() {
        let dets = stream::pending::<Detection>();

        let robot = Pose::planar(Frame::World, Frame::Robot, 0.0, 0.0, 0.0);
        let planned = Pose::planar(Frame::World, Frame::Hole, 2.0, 0.0, 0.0);

        let res = refiner()
            .try_refine(dets, &robot, &planned, Duration::from_secs(2), 0.5, 3)
            .await;
        assert_eq!(res.unwrap_err(), VisionError::NoDetection);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refine_outside_search_zone() {
        let dets = stream::iter(vec![det(0.5, 0.9, Some(3.0))]);

        let robot = Pose::planar(Frame::World, Frame::Robot, 0.0, 0.0, 0.0);
        let planned = Pose::planar(Frame::World, Frame::Hole, 2.0, 0.0, 0.0);

        let target = refiner()
            .refine(dets, &robot, &planned, Duration::from_secs(2), 0.5, 1)
            .await;

        // Falls back to the planned target
        assert!(!target.valid);
        assert_eq!(target.or(&planned), planned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refine_without_depth() {
        let dets = stream::iter(vec![det(0.5, 0.9, None)]);

        let robot = Pose::planar(Frame::World, Frame::Robot, 0.0, 0.0, 0.0);
        let planned = Pose::planar(Frame::World, Frame::Hole, 2.0, 0.0, 0.0);

        let res = refiner()
            .try_refine(dets, &robot, &planned, Duration::from_secs(2), 0.5, 1)
            .await;
        assert_eq!(res.unwrap_err(), VisionError::NoDepth);
    }
}
