//! # Track Follower Communications Module

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Handle to a track loaded into the follower, issued by the follower on submission.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackHandle(pub u64);

/// A track as sent to the follower service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TrackRequest {
    /// Generation id of the track, monotonically increasing over a mission
    pub generation: u64,

    /// Name of the frame the points are expressed in
    pub frame: String,

    /// Ordered points to follow
    pub points: Vec<TrackPoint>,
}

/// A single point on a track
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub x_m: f64,
    pub y_m: f64,
    pub heading_rad: f64,
}

/// Follower state reported for a particular track handle.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct FollowerState {
    pub status: FollowerStatus,

    /// Index of the last track point reached, if following has begun
    pub point_index: Option<usize>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Lifecycle of a track inside the follower.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum FollowerStatus {
    Idle,
    Loading,
    Following,
    Complete,
    Failed,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl FollowerStatus {
    /// Returns true if no further transitions will occur for the track.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FollowerStatus::Complete | FollowerStatus::Failed)
    }
}

impl std::fmt::Display for TrackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track#{}", self.0)
    }
}
