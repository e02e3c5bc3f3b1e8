//! # Actuator Bus Communications Module
//!
//! Commands sent over the CAN actuator service. Frame encoding is owned by the service itself,
//! the mission only deals in these typed commands.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Identifiers of commands which may be acknowledged by the actuator service.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    /// Deploy the depth probe into the hole
    ProbeDeploy,

    /// Open or close the dispenser chute
    Dispenser,

    /// Base motion demand
    Twist,
}

/// Commands accepted by the actuator service
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub enum ActCmd {
    /// Trigger a probe deployment and measurement
    DeployProbe,

    /// Set the dispenser chute state
    Dispenser { open: bool },

    /// Drive the base with the given linear and angular velocities
    Twist {
        linear_ms: f64,
        angular_rads: f64,
    },
}

/// Response to an acknowledgement wait.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum AckResponse {
    /// The command was received and executed
    Positive,

    /// The equipment explicitly refused or failed the command
    Negative,

    /// No acknowledgement arrived within the wait period
    None,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl ActCmd {
    /// Get the id which acknowledgements for this command will carry.
    pub fn id(&self) -> CommandId {
        match self {
            ActCmd::DeployProbe => CommandId::ProbeDeploy,
            ActCmd::Dispenser { .. } => CommandId::Dispenser,
            ActCmd::Twist { .. } => CommandId::Twist,
        }
    }

    /// A twist demand with zero velocities.
    pub fn stop() -> Self {
        ActCmd::Twist {
            linear_ms: 0.0,
            angular_rads: 0.0,
        }
    }
}
