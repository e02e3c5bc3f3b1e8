//! # Path
//!
//! This module defines the tracks driven by the robot. A track is an ordered list of segments,
//! each a list of poses in the world frame spaced closely enough for the track follower to
//! interpolate between them.
//!
//! Once built a track is never modified. Replanning always produces a new track with a new
//! generation id.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::f64::consts::{FRAC_PI_2, PI};

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use comms_if::eqpt::follower::{TrackPoint, TrackRequest};
use util::maths::wrap_pi;

use super::loc::{Frame, Pose};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A track for the robot to follow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    generation: u64,
    segments: Vec<TrackSegment>,
}

/// A contiguous part of a track with a single kind of motion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSegment {
    pub kind: SegmentKind,
    pub poses: Vec<Pose>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SegmentKind {
    /// Drive straight ahead
    Straight { length_m: f64 },

    /// Drive straight backwards, facing away from the direction of motion
    Reverse { length_m: f64 },

    /// Rotate in place, positive angles turn left
    Turn { angle_rad: f64 },

    /// Drive straight across to the next row
    Lateral { length_m: f64, side: TurnDirection },
}

/// Which way the robot turns at the end of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDirection {
    Left,
    Right,
}

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("Attempted to create a track with no segments")]
    EmptyTrack,

    #[error("Segment {0} of the track has no poses")]
    EmptySegment(usize),

    #[error("Track pose is expressed in the {found} frame, expected {expected}")]
    WrongFrame { expected: Frame, found: Frame },

    #[error("Point spacing must be positive, got {0}")]
    InvalidSpacing(f64),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Track {
    /// Build a new track from its segments.
    ///
    /// Tracks must contain at least one segment, no empty segments, and only robot poses in the
    /// world frame.
    pub fn new(generation: u64, segments: Vec<TrackSegment>) -> Result<Self, PathError> {
        if segments.is_empty() {
            return Err(PathError::EmptyTrack);
        }

        for (i, seg) in segments.iter().enumerate() {
            if seg.poses.is_empty() {
                return Err(PathError::EmptySegment(i));
            }

            for pose in seg.poses.iter() {
                if pose.frame != Frame::World {
                    return Err(PathError::WrongFrame {
                        expected: Frame::World,
                        found: pose.frame,
                    });
                }
            }
        }

        Ok(Self {
            generation,
            segments,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn segments(&self) -> &[TrackSegment] {
        &self.segments
    }

    /// Iterate over every pose in the track in order.
    pub fn poses(&self) -> impl Iterator<Item = &Pose> {
        self.segments.iter().flat_map(|s| s.poses.iter())
    }

    pub fn num_points(&self) -> usize {
        self.segments.iter().map(|s| s.poses.len()).sum()
    }

    /// The final pose of the track.
    pub fn end_pose(&self) -> Option<&Pose> {
        self.segments.last().and_then(|s| s.poses.last())
    }

    /// Index one past the last point of each segment, in track point numbering.
    pub fn segment_ends(&self) -> Vec<usize> {
        self.segments
            .iter()
            .scan(0, |acc, s| {
                *acc += s.poses.len();
                Some(*acc)
            })
            .collect()
    }

    /// Convert into the request sent to the track follower.
    pub fn to_request(&self) -> TrackRequest {
        TrackRequest {
            generation: self.generation,
            frame: Frame::World.to_string(),
            points: self
                .poses()
                .map(|p| TrackPoint {
                    x_m: p.position_m.x,
                    y_m: p.position_m.y,
                    heading_rad: p.heading(),
                })
                .collect(),
        }
    }
}

impl TrackSegment {
    /// Produces a straight segment from `from` to `to`, with each point having at most the given
    /// separation. The start point is not included.
    ///
    /// Every pose faces along the direction of travel, unless the points coincide in which case
    /// the single output pose keeps the heading of `from`.
    pub fn straight(
        from: Vector2<f64>,
        to: Vector2<f64>,
        from_heading_rad: f64,
        point_sep_m: f64,
    ) -> Result<Self, PathError> {
        let poses = straight_poses(from, to, from_heading_rad, point_sep_m, false)?;
        Ok(Self {
            kind: SegmentKind::Straight {
                length_m: (to - from).norm(),
            },
            poses,
        })
    }

    /// Produces a straight driven backwards from `from` to `to`, so the robot keeps facing the
    /// way it came from.
    pub fn reverse(
        from: Vector2<f64>,
        to: Vector2<f64>,
        from_heading_rad: f64,
        point_sep_m: f64,
    ) -> Result<Self, PathError> {
        let poses = straight_poses(from, to, from_heading_rad, point_sep_m, true)?;
        Ok(Self {
            kind: SegmentKind::Reverse {
                length_m: (to - from).norm(),
            },
            poses,
        })
    }

    /// Produces a straight crossing between rows.
    pub fn lateral(
        from: Vector2<f64>,
        to: Vector2<f64>,
        from_heading_rad: f64,
        side: TurnDirection,
        point_sep_m: f64,
    ) -> Result<Self, PathError> {
        let poses = straight_poses(from, to, from_heading_rad, point_sep_m, false)?;
        Ok(Self {
            kind: SegmentKind::Lateral {
                length_m: (to - from).norm(),
                side,
            },
            poses,
        })
    }

    /// Produces an in-place turn of `angle_rad` about `at`, with each step having at most the
    /// given angular separation. The start heading is not included.
    pub fn turn(
        at: Vector2<f64>,
        from_heading_rad: f64,
        angle_rad: f64,
        step_sep_rad: f64,
    ) -> Result<Self, PathError> {
        if step_sep_rad <= 0.0 {
            return Err(PathError::InvalidSpacing(step_sep_rad));
        }

        let num_steps = ((angle_rad.abs() / step_sep_rad).ceil() as usize).max(1);
        let poses = (1..=num_steps)
            .map(|i| {
                let heading = from_heading_rad + angle_rad * (i as f64) / (num_steps as f64);
                Pose::planar(Frame::World, Frame::Robot, at.x, at.y, heading)
            })
            .collect();

        Ok(Self {
            kind: SegmentKind::Turn { angle_rad },
            poses,
        })
    }
}

impl TurnDirection {
    /// Signed quarter turn in this direction.
    pub fn quarter_turn_rad(&self) -> f64 {
        match self {
            TurnDirection::Left => FRAC_PI_2,
            TurnDirection::Right => -FRAC_PI_2,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            TurnDirection::Left => TurnDirection::Right,
            TurnDirection::Right => TurnDirection::Left,
        }
    }
}

fn straight_poses(
    from: Vector2<f64>,
    to: Vector2<f64>,
    from_heading_rad: f64,
    point_sep_m: f64,
    reverse: bool,
) -> Result<Vec<Pose>, PathError> {
    if point_sep_m <= 0.0 {
        return Err(PathError::InvalidSpacing(point_sep_m));
    }

    let diff_vec = to - from;
    let dist = diff_vec.norm();

    if dist < f64::EPSILON {
        return Ok(vec![Pose::planar(
            Frame::World,
            Frame::Robot,
            to.x,
            to.y,
            from_heading_rad,
        )]);
    }

    let heading = if reverse {
        wrap_pi(diff_vec.y.atan2(diff_vec.x) + PI)
    } else {
        diff_vec.y.atan2(diff_vec.x)
    };

    // Ceil so no two points are more than the separation apart, the last point is always `to`
    let num_points = (dist / point_sep_m).ceil() as usize;

    Ok((1..=num_points)
        .map(|i| {
            let p = from + diff_vec * (i as f64) / (num_points as f64);
            Pose::planar(Frame::World, Frame::Robot, p.x, p.y, heading)
        })
        .collect())
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
