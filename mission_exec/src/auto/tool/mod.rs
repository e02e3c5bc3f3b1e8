//! # Tool module
//!
//! The tool orchestrator runs the deployment sequence of whichever tool module is fitted to the
//! robot once it has arrived over a hole. Each module can check it is ready, calibrate itself
//! before a mission, and execute its sequence at a hole.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod stemming;

pub use stemming::{StemmingParams, StemmingTool};

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::fmt;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use comms_if::eqpt::{act::CommandId, EqptError};

use super::loc::Pose;
use crate::eqpt::{ActClient, CamClient};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Runs the deployment sequence of the fitted tool.
pub struct ToolOrchestrator {
    module: ToolModule,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolParams {
    /// Which tool module is fitted
    pub module: ToolKind,

    /// Position of the probe tip in the robot frame
    pub probe_offset_m_rb: [f64; 3],

    /// Parameters of the stemming module
    pub stemming: StemmingParams,
}

/// Equipment the tool is allowed to drive during its sequence.
pub struct ToolEqpt<'a> {
    pub act: &'a mut dyn ActClient,
    pub cam: &'a mut dyn CamClient,
}

/// Result of a tool deployment.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub success: bool,

    /// The stage at which the sequence failed
    pub stage: Option<ToolStage>,

    pub error: Option<ToolError>,

    pub message: String,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// The tool modules which can be fitted.
pub enum ToolModule {
    Stemming(StemmingTool),

    /// No tool fitted, every deployment trivially succeeds.
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Stemming,
    Null,
}

/// Stages of a deployment sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolStage {
    Ready,
    Calibration,
    Alignment,
    ProbeDeploy,
    Translate,
    Dispense,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("Tool is {error_m:.3} m off the hole, tolerance is {tolerance_m:.3} m")]
    AlignmentFailed { error_m: f64, tolerance_m: f64 },

    #[error("No hole seen by the alignment camera")]
    NoAlignmentDetection,

    #[error("No acknowledgement of {0:?}")]
    AckTimeout(CommandId),

    #[error("{0:?} was refused")]
    AckNegative(CommandId),

    #[error("Equipment error: {0}")]
    Eqpt(#[from] EqptError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl ToolOrchestrator {
    pub fn new(module: ToolModule) -> Self {
        Self { module }
    }

    /// Build the orchestrator for the module selected in the parameters.
    pub fn from_params(params: &ToolParams) -> Self {
        let module = match params.module {
            ToolKind::Stemming => ToolModule::Stemming(StemmingTool::new(params.stemming.clone())),
            ToolKind::Null => ToolModule::Null,
        };
        Self::new(module)
    }

    pub fn name(&self) -> &'static str {
        match self.module {
            ToolModule::Stemming(_) => "stemming",
            ToolModule::Null => "null",
        }
    }

    /// Check the tool is ready to be used.
    pub async fn verify_ready(&mut self, eqpt: ToolEqpt<'_>) -> ToolResult {
        let res = match &mut self.module {
            ToolModule::Stemming(t) => t.verify_ready(eqpt).await,
            ToolModule::Null => Ok(()),
        };
        self.result(res, ToolStage::Ready, "ready")
    }

    /// Calibrate the tool before a mission.
    pub async fn calibrate(&mut self, eqpt: ToolEqpt<'_>) -> ToolResult {
        let res = match &mut self.module {
            ToolModule::Stemming(t) => t.calibrate(eqpt).await,
            ToolModule::Null => Ok(()),
        };
        self.result(res, ToolStage::Calibration, "calibrated")
    }

    /// Run the deployment sequence at a hole.
    pub async fn deploy(&mut self, target: &Pose, eqpt: ToolEqpt<'_>) -> ToolResult {
        info!("Deploying {} tool at {}", self.name(), target);

        match &mut self.module {
            ToolModule::Stemming(t) => match t.execute(eqpt).await {
                Ok(()) => ToolResult::success("hole stemmed"),
                Err((stage, error)) => {
                    warn!("Stemming failed during {:?}: {}", stage, error);
                    ToolResult::failure(stage, error)
                }
            },
            ToolModule::Null => ToolResult::success("no tool fitted"),
        }
    }

    fn result(&self, res: Result<(), ToolError>, stage: ToolStage, msg: &str) -> ToolResult {
        match res {
            Ok(()) => {
                info!("{} tool {}", self.name(), msg);
                ToolResult::success(msg)
            }
            Err(e) => {
                warn!("{} tool not {}: {}", self.name(), msg, e);
                ToolResult::failure(stage, e)
            }
        }
    }
}

impl ToolResult {
    pub fn success(message: &str) -> Self {
        Self {
            success: true,
            stage: None,
            error: None,
            message: message.to_string(),
        }
    }

    pub fn failure(stage: ToolStage, error: ToolError) -> Self {
        Self {
            success: false,
            stage: Some(stage),
            message: error.to_string(),
            error: Some(error),
        }
    }
}

impl fmt::Display for ToolResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) if !self.success => write!(f, "failed at {:?}: {}", stage, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
