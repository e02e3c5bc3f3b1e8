//! # Navigation module
//!
//! Navigation plans tracks ([`path_planner`]) and drives them by handing them to the external
//! track follower and supervising their progress ([`NavExec`]).
//!
//! The executor owns at most one active track at a time. A new track is only accepted once the
//! follower reports the previous one as complete or failed, or the executor has cancelled it.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod path_planner;

pub use path_planner::{PathPlanner, PathPlannerParams};

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use tokio::time::Instant;

use comms_if::eqpt::{
    follower::{FollowerStatus, TrackHandle},
    EqptError,
};

use crate::{auto::path::Track, eqpt::FollowerClient};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Supervises the execution of tracks by the track follower.
pub struct NavExec {
    params: NavExecParams,

    active: Option<ActiveTrack>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NavExecParams {
    /// Period between follower status polls.
    pub status_period_s: f64,

    /// Maximum time to wait for a single request to the follower.
    pub request_timeout_s: f64,
}

/// A track which has been handed to the follower.
struct ActiveTrack {
    handle: TrackHandle,

    track: Track,

    status: FollowerStatus,

    /// Number of segments the follower has finished
    segments_done: usize,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NavError {
    #[error("Track {0} did not complete in time and was cancelled")]
    Timeout(TrackHandle),

    #[error("The follower failed track {0}")]
    Rejected(TrackHandle),

    #[error("Track {handle} is still {status:?}, cannot submit a new track")]
    TrackActive {
        handle: TrackHandle,
        status: FollowerStatus,
    },

    #[error("There is no active track to wait on")]
    NoActiveTrack,

    #[error("Follower error: {0}")]
    Eqpt(#[from] EqptError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl NavExecParams {
    fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_s)
    }
}

impl NavExec {
    pub fn new(params: NavExecParams) -> Self {
        Self {
            params,
            active: None,
        }
    }

    /// Returns true if a track has been submitted and not yet finished.
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| !a.status.is_terminal())
            .unwrap_or(false)
    }

    /// Submit a new track to the follower.
    ///
    /// If a previous track exists its status is refreshed first, and the submission is rejected
    /// if it is still loading or being followed.
    pub async fn submit(
        &mut self,
        follower: &mut dyn FollowerClient,
        track: Track,
    ) -> Result<TrackHandle, NavError> {
        if let Some(handle) = self.active.as_ref().map(|a| a.handle) {
            let status = match self.request(follower.status(handle)).await {
                Ok(state) => state.status,
                // Can't confirm the previous track finished, so assume it's still running
                Err(e) => {
                    warn!("Could not refresh status of {}: {}", handle, e);
                    FollowerStatus::Following
                }
            };

            if !status.is_terminal() {
                warn!(
                    "Rejecting track gen {}, {} is still {:?}",
                    track.generation(),
                    handle,
                    status
                );
                if let Some(a) = self.active.as_mut() {
                    a.status = status;
                }
                return Err(NavError::TrackActive { handle, status });
            }

            self.active = None;
        }

        let request = track.to_request();
        let handle = self.request(follower.submit(&request)).await?;

        info!(
            "Submitted track gen {} as {} ({} segments, {} points)",
            track.generation(),
            handle,
            track.segments().len(),
            track.num_points()
        );

        self.active = Some(ActiveTrack {
            handle,
            track,
            status: FollowerStatus::Loading,
            segments_done: 0,
        });

        Ok(handle)
    }

    /// Wait for the active track to complete.
    ///
    /// If the track is not complete within `timeout` it is cancelled. Either way, once this
    /// returns there is no active track.
    pub async fn wait(
        &mut self,
        follower: &mut dyn FollowerClient,
        timeout: Duration,
    ) -> Result<(), NavError> {
        let handle = match self.active.as_ref() {
            Some(a) => a.handle,
            None => return Err(NavError::NoActiveTrack),
        };

        let deadline = Instant::now() + timeout;
        let mut interval =
            tokio::time::interval(Duration::from_secs_f64(self.params.status_period_s));

        loop {
            if tokio::time::timeout_at(deadline, interval.tick()).await.is_err() {
                break;
            }

            let state = match tokio::time::timeout_at(deadline, follower.status(handle)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    warn!("Could not get status of {}: {}", handle, e);
                    continue;
                }
                Err(_) => break,
            };

            self.update_progress(state.status, state.point_index);

            match state.status {
                FollowerStatus::Complete => {
                    info!("{} complete", handle);
                    self.active = None;
                    return Ok(());
                }
                FollowerStatus::Failed => {
                    warn!("Follower failed {}", handle);
                    self.active = None;
                    return Err(NavError::Rejected(handle));
                }
                _ => (),
            }
        }

        warn!(
            "{} not complete after {:.1} s, cancelling",
            handle,
            timeout.as_secs_f64()
        );
        self.cancel(follower).await;

        Err(NavError::Timeout(handle))
    }

    /// Submit a track and wait for it to be completed.
    pub async fn execute(
        &mut self,
        follower: &mut dyn FollowerClient,
        track: Track,
        timeout: Duration,
    ) -> Result<(), NavError> {
        self.submit(follower, track).await?;
        self.wait(follower, timeout).await
    }

    /// Cancel the active track, if there is one.
    ///
    /// The track is forgotten even if the follower doesn't confirm the cancellation.
    pub async fn cancel(&mut self, follower: &mut dyn FollowerClient) {
        if let Some(active) = self.active.take() {
            match self.request(follower.cancel(active.handle)).await {
                Ok(()) => info!("Cancelled {}", active.handle),
                Err(e) => warn!("Could not cancel {}: {}", active.handle, e),
            }
        }
    }

    /// Log segment transitions of the active track.
    fn update_progress(&mut self, status: FollowerStatus, point_index: Option<usize>) {
        let active = match self.active.as_mut() {
            Some(a) => a,
            None => return,
        };

        if active.status != status {
            debug!("{} {:?} -> {:?}", active.handle, active.status, status);
            active.status = status;
        }

        let points_done = match (status, point_index) {
            (FollowerStatus::Complete, _) => active.track.num_points(),
            (_, Some(i)) => i + 1,
            (_, None) => 0,
        };

        let ends = active.track.segment_ends();
        let done = ends.iter().filter(|&&end| end <= points_done).count();

        while active.segments_done < done {
            let seg = &active.track.segments()[active.segments_done];
            info!(
                "{} segment {}/{} ({:?}) done",
                active.handle,
                active.segments_done + 1,
                ends.len(),
                seg.kind
            );
            active.segments_done += 1;
        }
    }

    /// Make a single bounded request to the follower.
    async fn request<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, EqptError>>,
    ) -> Result<T, EqptError> {
        match tokio::time::timeout(self.params.request_timeout(), fut).await {
            Ok(r) => r,
            Err(_) => Err(EqptError::Timeout),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
