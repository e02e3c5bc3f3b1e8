//! # Equipment clients
//!
//! The mission never owns the external services, it is handed a long-lived handle to each one.
//! This module defines the interface those handles must provide.
//!
//! Control of the motion base is never shared: each component borrows the handle it drives
//! (`&mut`) only for the duration of its own call, so the convergence guard, the navigation
//! executor and the tool orchestrator can never be commanding the robot at the same time.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use log::{info, warn};

use comms_if::eqpt::{
    act::{AckResponse, ActCmd, CommandId},
    cam::{CamId, Detection},
    follower::{FollowerState, TrackHandle, TrackRequest},
    loc::{FilterState, RotationDemand},
    EqptError,
};

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Client of the localisation filter service.
#[async_trait]
pub trait LocClient: Send {
    /// Connect to the service.
    async fn init(&mut self) -> Result<(), EqptError> {
        Ok(())
    }

    /// Release the connection to the service.
    async fn shutdown(&mut self) -> Result<(), EqptError> {
        Ok(())
    }

    /// Get the latest filter state, including whether it has converged.
    async fn poll_convergence(&mut self) -> Result<FilterState, EqptError>;

    /// Rotate the robot in place, returning once the rotation has been held for its duration.
    async fn command_rotation(&mut self, demand: RotationDemand) -> Result<(), EqptError>;
}

/// Client of the track follower service.
#[async_trait]
pub trait FollowerClient: Send {
    async fn init(&mut self) -> Result<(), EqptError> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), EqptError> {
        Ok(())
    }

    /// Load a new track into the follower and begin following it.
    async fn submit(&mut self, track: &TrackRequest) -> Result<TrackHandle, EqptError>;

    /// Get the state of a previously submitted track.
    async fn status(&mut self, handle: TrackHandle) -> Result<FollowerState, EqptError>;

    /// Stop following the given track.
    async fn cancel(&mut self, handle: TrackHandle) -> Result<(), EqptError>;
}

/// Client of the actuator (CAN bus) service.
#[async_trait]
pub trait ActClient: Send {
    async fn init(&mut self) -> Result<(), EqptError> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), EqptError> {
        Ok(())
    }

    /// Send a command onto the bus.
    async fn send(&mut self, cmd: ActCmd) -> Result<(), EqptError>;

    /// Wait up to `timeout` for the acknowledgement of the given command.
    async fn await_ack(
        &mut self,
        id: CommandId,
        timeout: Duration,
    ) -> Result<AckResponse, EqptError>;
}

/// Client of the camera and inference service.
#[async_trait]
pub trait CamClient: Send {
    async fn init(&mut self) -> Result<(), EqptError> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), EqptError> {
        Ok(())
    }

    /// Subscribe to the detections of the given camera.
    ///
    /// The stream is unbounded, dropping it ends the subscription and calling this again starts a
    /// fresh one.
    async fn detections(&mut self, cam: CamId)
        -> Result<BoxStream<'static, Detection>, EqptError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Handles to all services used by a mission.
pub struct Services {
    pub loc: Box<dyn LocClient>,
    pub follower: Box<dyn FollowerClient>,
    pub act: Box<dyn ActClient>,
    pub cam: Box<dyn CamClient>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Services {
    /// Initialise every service, stopping at the first one which fails.
    pub async fn init(&mut self) -> Result<(), EqptError> {
        self.loc.init().await?;
        self.follower.init().await?;
        self.act.init().await?;
        self.cam.init().await?;

        info!("Services initialised");
        Ok(())
    }

    /// Shut every service down. Failures are logged, all services are always visited.
    pub async fn shutdown(&mut self) {
        let results = [
            ("loc", self.loc.shutdown().await),
            ("follower", self.follower.shutdown().await),
            ("act", self.act.shutdown().await),
            ("cam", self.cam.shutdown().await),
        ];

        for (name, res) in results.iter() {
            if let Err(e) = res {
                warn!("Could not shut down the {} service: {}", name, e);
            }
        }

        info!("Services shut down");
    }
}
