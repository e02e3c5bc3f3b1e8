//! # Simulation Client
//!
//! The sim client provides in-process stand-ins for the external services so the mission can be
//! run without the robot. It is to be used for testing and development of systems rather than
//! actual operation. All clients share a single [`SimWorld`], which holds:
//!
//! - The robot pose, moved by completed tracks, wiggles and twist demands.
//! - Filter convergence, which can be set to converge after a number of wiggles or never.
//! - Track follower behaviour, including loading time, speed, failures and stalls.
//! - Actuator acknowledgements, scripted per command.
//! - Camera detections, either fixed or projected from the true hole positions.
//!
//! The world also records what the mission did (rotations, tracks, commands) so tests can check
//! it.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{
    stream::{self, BoxStream},
    StreamExt,
};
use log::{debug, trace};
use nalgebra::{Vector2, Vector3};
use serde::Deserialize;
use tokio::time::Instant;

use comms_if::eqpt::{
    act::{AckResponse, ActCmd, CommandId},
    cam::{BoundingBox, CamId, Detection},
    follower::{FollowerState, FollowerStatus, TrackHandle, TrackRequest},
    loc::{FilterState, RotationDemand},
    EqptError,
};
use util::maths::heading_delta;

use crate::{
    auto::{
        loc::Pose,
        per::CamCalibration,
    },
    eqpt::{ActClient, CamClient, FollowerClient, LocClient, Services},
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Period between simulated camera detections.
const DETECTION_PERIOD: Duration = Duration::from_millis(100);

/// Confidence of simulated detections.
const DETECTION_CONFIDENCE: f64 = 0.9;

/// Size of simulated detection boxes in normalised image coordinates.
const DETECTION_BOX_SIZE: f64 = 0.05;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The shared state of the simulated robot and its services.
#[derive(Clone)]
pub struct SimWorld {
    state: Arc<Mutex<SimState>>,
}

/// Parameters of the simulated world.
#[derive(Debug, Clone, Deserialize)]
pub struct SimParams {
    /// Start position of the robot in the world frame.
    pub start_position_m: [f64; 2],

    /// Start heading of the robot in the world frame.
    pub start_heading_rad: f64,

    /// Number of wiggles needed before the filter converges, omit to never converge.
    #[serde(default)]
    pub converge_after_rotations: Option<usize>,

    pub follower_speed_ms: f64,

    pub follower_turn_rate_rads: f64,

    pub follower_load_time_s: f64,

    /// Offset of every true hole position from the surveyed one, in the world frame.
    pub hole_offset_m: [f64; 2],

    /// Width of ground seen by the downward camera.
    pub downward_footprint_m: f64,
}

pub struct SimLocClient {
    world: SimWorld,
}

pub struct SimFollowerClient {
    world: SimWorld,
}

pub struct SimActClient {
    world: SimWorld,
}

pub struct SimCamClient {
    world: SimWorld,
}

struct SimState {
    position_m: [f64; 3],
    heading_rad: f64,

    converge_after_rotations: Option<usize>,
    rotations: Vec<RotationDemand>,

    follower_speed_ms: f64,
    follower_turn_rate_rads: f64,
    follower_load_time_s: f64,
    follower_stalls: bool,
    fail_next_tracks: usize,
    tracks: Vec<SimTrack>,
    cancelled: Vec<TrackHandle>,

    sent: Vec<ActCmd>,
    ack_queue: HashMap<CommandId, VecDeque<AckResponse>>,
    ack_default: HashMap<CommandId, AckResponse>,
    twist_start: Option<(f64, Instant)>,

    forward_feed: CamFeed,
    downward_feed: CamFeed,
    detection_count: usize,
}

struct SimTrack {
    handle: TrackHandle,
    request: TrackRequest,
    submitted: Instant,

    /// Time at which each point is reached, from the end of loading
    point_times_s: Vec<f64>,

    fails: bool,
    cancelled: bool,
    applied: bool,
}

/// Geometry needed to project the true hole positions into the cameras.
#[derive(Clone)]
struct WorldGeometry {
    holes_m: Vec<Vector2<f64>>,
    forward_calib: CamCalibration,
    robot_from_tool: Pose,
    downward_footprint_m: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Source of a simulated camera's detections.
#[derive(Clone)]
enum CamFeed {
    /// The camera sees nothing
    Empty,

    /// The camera cycles through the given detections
    Fixed(Vec<Detection>),

    /// The camera sees the true holes
    World(Box<WorldGeometry>),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for SimWorld {
    /// A robot at the origin facing north, whose filter is always converged and whose downward
    /// camera sees a hole in the centre of the image.
    fn default() -> Self {
        let state = SimState {
            position_m: [0.0; 3],
            heading_rad: 0.0,
            converge_after_rotations: Some(0),
            rotations: Vec::new(),
            follower_speed_ms: 0.5,
            follower_turn_rate_rads: 0.5,
            follower_load_time_s: 0.5,
            follower_stalls: false,
            fail_next_tracks: 0,
            tracks: Vec::new(),
            cancelled: Vec::new(),
            sent: Vec::new(),
            ack_queue: HashMap::new(),
            ack_default: HashMap::new(),
            twist_start: None,
            forward_feed: CamFeed::Empty,
            downward_feed: CamFeed::Fixed(vec![detection(CamId::Downward, 0.5, 0.5, None)]),
            detection_count: 0,
        };

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

impl SimWorld {
    /// Build a world with holes at the given surveyed positions, offset by the configured error.
    ///
    /// Both cameras see the true holes.
    pub fn from_params(
        params: &SimParams,
        surveyed_holes_m: &[Vector2<f64>],
        forward_calib: CamCalibration,
        robot_from_tool: Pose,
    ) -> Self {
        let world = Self::default();
        let offset = Vector2::from(params.hole_offset_m);

        let geometry = WorldGeometry {
            holes_m: surveyed_holes_m.iter().map(|h| h + offset).collect(),
            forward_calib,
            robot_from_tool,
            downward_footprint_m: params.downward_footprint_m,
        };

        {
            let mut state = world.state();
            let [x, y] = params.start_position_m;
            state.position_m = [x, y, 0.0];
            state.heading_rad = params.start_heading_rad;
            state.converge_after_rotations = params.converge_after_rotations;
            state.follower_speed_ms = params.follower_speed_ms;
            state.follower_turn_rate_rads = params.follower_turn_rate_rads;
            state.follower_load_time_s = params.follower_load_time_s;
            state.forward_feed = CamFeed::World(Box::new(geometry.clone()));
            state.downward_feed = CamFeed::World(Box::new(geometry));
        }

        world
    }

    /// Services backed by this world.
    pub fn services(&self) -> Services {
        Services {
            loc: Box::new(self.loc_client()),
            follower: Box::new(self.follower_client()),
            act: Box::new(self.act_client()),
            cam: Box::new(self.cam_client()),
        }
    }

    pub fn loc_client(&self) -> SimLocClient {
        SimLocClient {
            world: self.clone(),
        }
    }

    pub fn follower_client(&self) -> SimFollowerClient {
        SimFollowerClient {
            world: self.clone(),
        }
    }

    pub fn act_client(&self) -> SimActClient {
        SimActClient {
            world: self.clone(),
        }
    }

    pub fn cam_client(&self) -> SimCamClient {
        SimCamClient {
            world: self.clone(),
        }
    }

    pub fn set_pose(&self, x_m: f64, y_m: f64, heading_rad: f64) {
        let mut state = self.state();
        state.position_m = [x_m, y_m, 0.0];
        state.heading_rad = heading_rad;
    }

    /// Set how many wiggles the filter needs to converge, `None` for never.
    pub fn set_converge_after_rotations(&self, rotations: Option<usize>) {
        self.state().converge_after_rotations = rotations;
    }

    /// Make the follower accept tracks but never finish them.
    pub fn set_follower_stalls(&self, stalls: bool) {
        self.state().follower_stalls = stalls;
    }

    /// Make the follower fail the next `count` tracks it is given.
    pub fn fail_next_tracks(&self, count: usize) {
        self.state().fail_next_tracks = count;
    }

    /// Queue a response to the next acknowledgement wait for `id`.
    pub fn push_ack(&self, id: CommandId, response: AckResponse) {
        self.state()
            .ack_queue
            .entry(id)
            .or_default()
            .push_back(response);
    }

    /// Set the response to acknowledgement waits for `id` once its queue is empty.
    pub fn set_ack_default(&self, id: CommandId, response: AckResponse) {
        self.state().ack_default.insert(id, response);
    }

    /// Make the forward camera cycle through the given detections.
    pub fn set_forward_detections(&self, detections: Vec<Detection>) {
        self.state().forward_feed = CamFeed::Fixed(detections);
    }

    /// Make the downward camera see a hole centred at the given image position.
    pub fn set_downward_offset(&self, x_norm: f64, y_norm: f64) {
        self.state().downward_feed =
            CamFeed::Fixed(vec![detection(CamId::Downward, x_norm, y_norm, None)]);
    }

    /// Make the downward camera see nothing.
    pub fn clear_downward(&self) {
        self.state().downward_feed = CamFeed::Empty;
    }

    pub fn filter_state(&self) -> FilterState {
        self.state().filter_state()
    }

    pub fn rotations(&self) -> Vec<RotationDemand> {
        self.state().rotations.clone()
    }

    pub fn submitted_tracks(&self) -> Vec<TrackRequest> {
        self.state().tracks.iter().map(|t| t.request.clone()).collect()
    }

    pub fn cancelled_tracks(&self) -> Vec<TrackHandle> {
        self.state().cancelled.clone()
    }

    pub fn sent_commands(&self) -> Vec<ActCmd> {
        self.state().sent.clone()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread can't leave the state half updated, so poisoning is ignored
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Produce the next detection of the given camera, if it sees anything.
    fn detect(&self, cam: CamId) -> Option<Detection> {
        let mut state = self.state();
        state.detection_count += 1;

        let feed = match cam {
            CamId::Forward => &state.forward_feed,
            CamId::Downward => &state.downward_feed,
        };

        match feed {
            CamFeed::Empty => None,
            CamFeed::Fixed(dets) if dets.is_empty() => None,
            CamFeed::Fixed(dets) => {
                let mut det = dets[state.detection_count % dets.len()].clone();
                det.timestamp = Utc::now();
                Some(det)
            }
            CamFeed::World(geom) => {
                let world_from_robot = Pose::from(&state.filter_state());
                match cam {
                    CamId::Forward => geom.forward_detection(&world_from_robot),
                    CamId::Downward => geom.downward_detection(&world_from_robot),
                }
            }
        }
    }
}

impl SimState {
    fn filter_state(&self) -> FilterState {
        let converged = match self.converge_after_rotations {
            Some(n) => self.rotations.len() >= n,
            None => false,
        };

        FilterState {
            timestamp: Utc::now(),
            converged,
            position_m: self.position_m,
            heading_rad: self.heading_rad,
        }
    }

    /// Time needed to follow the points from the current pose.
    fn point_times_s(&self, request: &TrackRequest) -> Vec<f64> {
        let mut pos = Vector2::new(self.position_m[0], self.position_m[1]);
        let mut heading = self.heading_rad;
        let mut t = 0.0;

        request
            .points
            .iter()
            .map(|p| {
                let next = Vector2::new(p.x_m, p.y_m);
                t += (next - pos).norm() / self.follower_speed_ms;
                t += heading_delta(heading, p.heading_rad).abs() / self.follower_turn_rate_rads;
                pos = next;
                heading = p.heading_rad;
                t
            })
            .collect()
    }

    /// Work out the state of a track, moving the robot to its end once complete.
    fn track_state(&mut self, handle: TrackHandle) -> Option<FollowerState> {
        let load_s = self.follower_load_time_s;
        let stalls = self.follower_stalls;
        let track = self.tracks.iter_mut().find(|t| t.handle == handle)?;

        let elapsed_s = track.submitted.elapsed().as_secs_f64();
        let follow_s = track.point_times_s.last().copied().unwrap_or(0.0);
        let reached = track
            .point_times_s
            .iter()
            .take_while(|&&t| t <= elapsed_s - load_s)
            .count();
        let point_index = reached.checked_sub(1);

        let status = if track.cancelled {
            FollowerStatus::Failed
        } else if elapsed_s < load_s {
            FollowerStatus::Loading
        } else if stalls {
            FollowerStatus::Following
        } else if track.fails && elapsed_s >= load_s + follow_s / 2.0 {
            FollowerStatus::Failed
        } else if elapsed_s < load_s + follow_s {
            FollowerStatus::Following
        } else {
            FollowerStatus::Complete
        };

        let end = track.request.points.last().copied();
        let apply = status == FollowerStatus::Complete && !track.applied;
        if apply {
            track.applied = true;
        }

        if let (true, Some(end)) = (apply, end) {
            self.position_m = [end.x_m, end.y_m, self.position_m[2]];
            self.heading_rad = end.heading_rad;
            debug!("Sim robot reached ({:.2}, {:.2})", end.x_m, end.y_m);
        }

        Some(FollowerState {
            status,
            point_index,
        })
    }

    /// Apply the motion of a twist demand which has just ended.
    fn end_twist(&mut self) {
        if let Some((linear_ms, start)) = self.twist_start.take() {
            let dist_m = linear_ms * start.elapsed().as_secs_f64();
            self.position_m[0] += dist_m * self.heading_rad.cos();
            self.position_m[1] += dist_m * self.heading_rad.sin();
            trace!("Sim robot twisted {:.3} m", dist_m);
        }
    }
}

impl WorldGeometry {
    /// The closest hole visible to the forward camera.
    fn forward_detection(&self, world_from_robot: &Pose) -> Option<Detection> {
        let camera_from_world = world_from_robot
            .compose(&self.forward_calib.robot_from_camera())
            .inverse();

        self.holes_m
            .iter()
            .filter_map(|h| {
                let point_c = camera_from_world.transform_point(&Vector3::new(h.x, h.y, 0.0));
                self.forward_calib.camera_to_pixel(&point_c)
            })
            .min_by(|a, b| a.2.total_cmp(&b.2))
            .map(|(u, v, depth_m)| detection(CamId::Forward, u, v, Some(depth_m)))
    }

    /// The hole under the probe, if one is in view of the downward camera.
    ///
    /// The top of the image points along the robot's forward axis.
    fn downward_detection(&self, world_from_robot: &Pose) -> Option<Detection> {
        let world_from_tool = world_from_robot.compose(&self.robot_from_tool);
        let tool_from_world = world_from_tool.inverse();

        self.holes_m
            .iter()
            .map(|h| {
                let hole_m = Vector3::new(h.x, h.y, world_from_tool.position_m.z);
                tool_from_world.transform_point(&hole_m)
            })
            .filter(|e| {
                e.x.abs() < self.downward_footprint_m / 2.0
                    && e.y.abs() < self.downward_footprint_m / 2.0
            })
            .min_by(|a, b| a.xy().norm().total_cmp(&b.xy().norm()))
            .map(|e| {
                let x_norm = 0.5 - e.y / self.downward_footprint_m;
                let y_norm = 0.5 - e.x / self.downward_footprint_m;
                detection(CamId::Downward, x_norm, y_norm, None)
            })
    }
}

#[async_trait]
impl LocClient for SimLocClient {
    async fn poll_convergence(&mut self) -> Result<FilterState, EqptError> {
        Ok(self.world.filter_state())
    }

    async fn command_rotation(&mut self, demand: RotationDemand) -> Result<(), EqptError> {
        self.world.state().rotations.push(demand);

        tokio::time::sleep(Duration::from_secs_f64(demand.duration_s)).await;

        self.world.state().heading_rad += demand.angular_velocity_rads * demand.duration_s;
        Ok(())
    }
}

#[async_trait]
impl FollowerClient for SimFollowerClient {
    async fn submit(&mut self, track: &TrackRequest) -> Result<TrackHandle, EqptError> {
        let mut state = self.world.state();

        if track.points.is_empty() {
            return Err(EqptError::RequestFailed(String::from("empty track")));
        }

        let handle = TrackHandle(state.tracks.len() as u64);
        let fails = state.fail_next_tracks > 0;
        if fails {
            state.fail_next_tracks -= 1;
        }

        let point_times_s = state.point_times_s(track);
        state.tracks.push(SimTrack {
            handle,
            request: track.clone(),
            submitted: Instant::now(),
            point_times_s,
            fails,
            cancelled: false,
            applied: false,
        });

        Ok(handle)
    }

    async fn status(&mut self, handle: TrackHandle) -> Result<FollowerState, EqptError> {
        self.world
            .state()
            .track_state(handle)
            .ok_or_else(|| EqptError::RequestFailed(format!("unknown track {}", handle)))
    }

    async fn cancel(&mut self, handle: TrackHandle) -> Result<(), EqptError> {
        let mut state = self.world.state();
        match state.tracks.iter_mut().find(|t| t.handle == handle) {
            Some(t) => t.cancelled = true,
            None => return Err(EqptError::RequestFailed(format!("unknown track {}", handle))),
        }
        state.cancelled.push(handle);
        Ok(())
    }
}

#[async_trait]
impl ActClient for SimActClient {
    async fn send(&mut self, cmd: ActCmd) -> Result<(), EqptError> {
        let mut state = self.world.state();
        state.sent.push(cmd);

        if let ActCmd::Twist { linear_ms, .. } = cmd {
            state.end_twist();
            if linear_ms != 0.0 {
                state.twist_start = Some((linear_ms, Instant::now()));
            }
        }

        Ok(())
    }

    async fn await_ack(
        &mut self,
        id: CommandId,
        timeout: Duration,
    ) -> Result<AckResponse, EqptError> {
        let response = {
            let mut state = self.world.state();
            let queued = state.ack_queue.get_mut(&id).and_then(|q| q.pop_front());
            queued
                .or_else(|| state.ack_default.get(&id).copied())
                .unwrap_or(AckResponse::Positive)
        };

        if response == AckResponse::None {
            tokio::time::sleep(timeout).await;
        }

        Ok(response)
    }
}

#[async_trait]
impl CamClient for SimCamClient {
    async fn detections(
        &mut self,
        cam: CamId,
    ) -> Result<BoxStream<'static, Detection>, EqptError> {
        let world = self.world.clone();

        Ok(stream::unfold(world, move |world| async move {
            tokio::time::sleep(DETECTION_PERIOD).await;
            let det = world.detect(cam);
            Some((det, world))
        })
        .filter_map(|det| async move { det })
        .boxed())
    }
}

/// A hole detection centred on the given image position.
pub fn detection(cam_id: CamId, x_norm: f64, y_norm: f64, depth_m: Option<f64>) -> Detection {
    Detection {
        cam_id,
        timestamp: Utc::now(),
        class: String::from("hole"),
        confidence: DETECTION_CONFIDENCE,
        bbox: BoundingBox::centred_on(x_norm, y_norm, DETECTION_BOX_SIZE, DETECTION_BOX_SIZE),
        depth_m,
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
