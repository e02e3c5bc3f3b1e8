//! # Filter convergence guard
//!
//! Before any pose-dependent action the mission asks the guard to make sure the localisation
//! filter has converged. If it hasn't the guard "wiggles" the robot with a short in-place
//! rotation, which excites the IMU and usually lets the filter settle, then checks again. Each
//! attempt rotates the opposite way to the previous one so the robot ends up roughly where it
//! started.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;

use comms_if::eqpt::{loc::RotationDemand, EqptError};

use super::Pose;
use crate::eqpt::LocClient;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Ensures the localisation filter has converged, wiggling the robot if needed.
#[derive(Debug, Clone)]
pub struct ConvGuard {
    params: ConvGuardParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConvGuardParams {
    /// Maximum time to wait for a single convergence poll to return.
    pub poll_timeout_s: f64,

    /// Number of wiggles to attempt before giving up.
    pub max_retries: usize,

    /// Angular velocity of a wiggle rotation.
    pub wiggle_angular_velocity_rads: f64,

    /// Duration of a wiggle rotation.
    pub wiggle_duration_s: f64,

    /// Time to let the filter settle after a wiggle before polling it again.
    pub settle_time_s: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConvergenceError {
    #[error("Filter did not converge after {attempts} wiggle attempts")]
    Diverged { attempts: usize },

    #[error("Could not command the wiggle rotation: {0}")]
    RotationFailed(EqptError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl ConvGuardParams {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.poll_timeout_s)
    }
}

impl ConvGuard {
    pub fn new(params: ConvGuardParams) -> Self {
        Self { params }
    }

    /// Ensure the filter is converged using the configured limits.
    pub async fn ensure(&self, loc: &mut dyn LocClient) -> Result<Pose, ConvergenceError> {
        self.ensure_converged(loc, self.params.poll_timeout(), self.params.max_retries)
            .await
    }

    /// Ensure the filter is converged, returning the converged pose of the robot.
    ///
    /// At most `max_retries` wiggles are commanded. A poll that fails or takes longer than
    /// `timeout` counts as not converged.
    pub async fn ensure_converged(
        &self,
        loc: &mut dyn LocClient,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Pose, ConvergenceError> {
        if let Some(pose) = poll(loc, timeout).await {
            return Ok(pose);
        }

        for attempt in 1..=max_retries {
            // Alternate the direction so the wiggles cancel out
            let direction = if attempt % 2 == 1 { 1.0 } else { -1.0 };
            let demand = RotationDemand {
                angular_velocity_rads: direction * self.params.wiggle_angular_velocity_rads,
                duration_s: self.params.wiggle_duration_s,
            };

            info!(
                "Filter not converged, wiggle {}/{} at {:.2} rad/s for {:.1} s",
                attempt, max_retries, demand.angular_velocity_rads, demand.duration_s
            );

            let rotation_limit = Duration::from_secs_f64(self.params.wiggle_duration_s) + timeout;
            match tokio::time::timeout(rotation_limit, loc.command_rotation(demand)).await {
                Ok(Ok(())) => (),
                Ok(Err(e)) => return Err(ConvergenceError::RotationFailed(e)),
                Err(_) => return Err(ConvergenceError::RotationFailed(EqptError::Timeout)),
            }

            tokio::time::sleep(Duration::from_secs_f64(self.params.settle_time_s)).await;

            if let Some(pose) = poll(loc, timeout).await {
                info!("Filter converged after {} wiggle(s)", attempt);
                return Ok(pose);
            }
        }

        warn!("Filter still not converged after {} wiggle(s)", max_retries);
        Err(ConvergenceError::Diverged {
            attempts: max_retries,
        })
    }
}

/// Poll the filter once, returning the robot pose if it has converged.
async fn poll(loc: &mut dyn LocClient, timeout: Duration) -> Option<Pose> {
    match tokio::time::timeout(timeout, loc.poll_convergence()).await {
        Ok(Ok(state)) if state.converged => Some(Pose::from(&state)),
        Ok(Ok(_)) => {
            debug!("Filter reports not converged");
            None
        }
        Ok(Err(e)) => {
            warn!("Could not poll the filter: {}", e);
            None
        }
        Err(_) => {
            warn!("Filter poll timed out after {:.2} s", timeout.as_secs_f64());
            None
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
