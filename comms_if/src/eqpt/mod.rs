//! # Equipment Interface
//!
//! This module defines the interface structures which will be sent to equipment servers/clients.

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

pub mod act;
pub mod cam;
pub mod follower;
pub mod loc;

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Errors which can be raised by any equipment client when talking to its service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EqptError {
    #[error("The client is not connected to the service")]
    NotConnected,

    #[error("The service did not respond in time")]
    Timeout,

    #[error("The service rejected the request: {0}")]
    RequestFailed(String),
}
