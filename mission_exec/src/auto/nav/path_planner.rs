//! Plans the tracks driven during a mission: the approach to a hole's search zone, the final
//! approach onto the hole, and the turn between the end of one row and the start of the next.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, warn};
use nalgebra::Vector2;
use serde::Deserialize;

use util::maths::heading_delta;

use crate::auto::{
    loc::Pose,
    path::{PathError, Track, TrackSegment, TurnDirection},
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Heading error left at the end of a refinement track.
const FINAL_HEADING_TOLERANCE_RAD: f64 = 1e-6;

/// Moves shorter than this are not planned.
const MIN_MOVE_M: f64 = 1e-6;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PathPlanner {
    params: PathPlannerParams,

    /// Generation id of the next track to be planned
    next_generation: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathPlannerParams {
    /// Distance short of the hole at which the approach track stops.
    pub approach_offset_m: f64,

    /// Maximum separation between points on a straight segment.
    pub straight_spacing_m: f64,

    /// Maximum heading change between points on a turn segment.
    pub turn_spacing_rad: f64,

    /// Heading errors smaller than this do not get a turn segment.
    pub heading_tolerance_rad: f64,

    /// Distance driven past the end of a row before turning.
    pub headland_distance_m: f64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl PathPlanner {
    pub fn new(params: PathPlannerParams) -> Self {
        Self {
            params,
            next_generation: 0,
        }
    }

    /// Continue generation numbering from a previous run.
    pub fn with_first_generation(mut self, generation: u64) -> Self {
        self.next_generation = generation;
        self
    }

    /// Generation id the next planned track will have.
    pub fn next_generation(&self) -> u64 {
        self.next_generation
    }

    /// Plan a track which stops short of `target` by the approach offset, facing it.
    ///
    /// If the robot is already closer than the offset it backs away until it is at the offset, so
    /// the forward camera can still see the target.
    pub fn plan_approach(&mut self, current: &Pose, target: &Pose) -> Result<Track, PathError> {
        let from = current.position2();
        let to = target.position2();
        let diff = to - from;
        let dist = diff.norm();
        let offset = self.params.approach_offset_m;

        // On top of the target there's no direction to it, back off along its heading instead
        let travel = if dist > f64::EPSILON {
            diff.y.atan2(diff.x)
        } else {
            target.heading()
        };
        let stop = to - Vector2::new(travel.cos(), travel.sin()) * offset;

        let mut segments = Vec::new();
        let mut heading = current.heading();

        let tolerance = self.params.heading_tolerance_rad;
        if let Some(turn) = self.turn_towards(current, heading, travel, tolerance)? {
            segments.push(turn);
            heading = travel;
        }

        if (stop - from).norm() > MIN_MOVE_M {
            let spacing = self.params.straight_spacing_m;
            if dist > offset {
                segments.push(TrackSegment::straight(from, stop, heading, spacing)?);
            } else {
                warn!(
                    "Already within the approach offset ({:.2} m < {:.2} m), backing off",
                    dist, offset
                );
                segments.push(TrackSegment::reverse(from, stop, heading, spacing)?);
            }
        }

        // Already at the offset facing the target, hold position
        if segments.is_empty() {
            segments.push(TrackSegment::straight(
                from,
                from,
                heading,
                self.params.straight_spacing_m,
            )?);
        }

        self.build(segments, "approach")
    }

    /// Plan the final track from the end of the approach onto `target`, finishing at the target
    /// heading.
    pub fn plan_refinement(
        &mut self,
        approach_end: &Pose,
        target: &Pose,
    ) -> Result<Track, PathError> {
        let from = approach_end.position2();
        let to = target.position2();
        let diff = to - from;

        let mut segments = Vec::new();
        let mut heading = approach_end.heading();

        if diff.norm() > f64::EPSILON {
            let travel = diff.y.atan2(diff.x);
            let tolerance = self.params.heading_tolerance_rad;
            if let Some(turn) = self.turn_towards(approach_end, heading, travel, tolerance)? {
                segments.push(turn);
            }
            let straight =
                TrackSegment::straight(from, to, travel, self.params.straight_spacing_m)?;
            heading = travel;
            segments.push(straight);
        }

        // The tool sits ahead of the robot, so even a small heading error moves it off the hole
        let mut end = *approach_end;
        end.position_m.x = to.x;
        end.position_m.y = to.y;
        if let Some(turn) =
            self.turn_towards(&end, heading, target.heading(), FINAL_HEADING_TOLERANCE_RAD)?
        {
            segments.push(turn);
        }

        // Already on target, still give the follower something to hold
        if segments.is_empty() {
            segments.push(TrackSegment::straight(
                from,
                to,
                heading,
                self.params.straight_spacing_m,
            )?);
        }

        self.build(segments, "refinement")
    }

    /// Plan the turn from the end of one row onto the start of the next.
    ///
    /// The track always has four segments: a straight out into the headland, a quarter turn in
    /// `direction`, a lateral crossing of `row_spacing_m`, and a second quarter turn in
    /// `direction`, leaving the robot facing back down the next row.
    pub fn plan_row_turn(
        &mut self,
        current: &Pose,
        row_spacing_m: f64,
        direction: TurnDirection,
    ) -> Result<Track, PathError> {
        let quarter = direction.quarter_turn_rad();
        let heading_0 = current.heading();
        let start = current.position2();

        let forward = Vector2::new(heading_0.cos(), heading_0.sin());
        let headland_end = start + forward * self.params.headland_distance_m;

        let heading_1 = heading_0 + quarter;
        let across = Vector2::new(heading_1.cos(), heading_1.sin());
        let lateral_end = headland_end + across * row_spacing_m;

        let segments = vec![
            TrackSegment::straight(
                start,
                headland_end,
                heading_0,
                self.params.straight_spacing_m,
            )?,
            TrackSegment::turn(
                headland_end,
                heading_0,
                quarter,
                self.params.turn_spacing_rad,
            )?,
            TrackSegment::lateral(
                headland_end,
                lateral_end,
                heading_1,
                direction,
                self.params.straight_spacing_m,
            )?,
            TrackSegment::turn(lateral_end, heading_1, quarter, self.params.turn_spacing_rad)?,
        ];

        self.build(segments, "row turn")
    }

    /// Turn segment from `heading` to `to_heading` at the pose position, if the heading error is
    /// more than `tolerance_rad`.
    fn turn_towards(
        &self,
        at: &Pose,
        heading: f64,
        to_heading: f64,
        tolerance_rad: f64,
    ) -> Result<Option<TrackSegment>, PathError> {
        let delta = heading_delta(heading, to_heading);
        if delta.abs() <= tolerance_rad {
            return Ok(None);
        }

        TrackSegment::turn(at.position2(), heading, delta, self.params.turn_spacing_rad).map(Some)
    }

    fn build(&mut self, segments: Vec<TrackSegment>, name: &str) -> Result<Track, PathError> {
        let track = Track::new(self.next_generation, segments)?;
        self.next_generation += 1;

        debug!(
            "Planned {} track gen {}: {} segments, {} points",
            name,
            track.generation(),
            track.segments().len(),
            track.num_points()
        );

        Ok(track)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::auto::{loc::Frame, path::SegmentKind};
    use std::f64::consts::FRAC_PI_2;

    fn planner() -> PathPlanner {
        PathPlanner::new(PathPlannerParams {
            approach_offset_m: 1.2,
            straight_spacing_m: 0.5,
            turn_spacing_rad: 0.15,
            heading_tolerance_rad: 0.05,
            headland_distance_m: 1.5,
        })
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_plan_approach() {
        let mut planner = planner();
        let current = Pose::planar(Frame::World, Frame::Robot, 0.0, 0.0, 0.0);
        let target = Pose::planar(Frame::World, Frame::Robot, 5.0, 0.0, 0.0);

        let track = planner.plan_approach(&current, &target).unwrap();
        assert_eq!(track.segments().len(), 1);

        let end = track.end_pose().unwrap();
        assert!((end.position2() - Vector2::new(3.8, 0.0)).norm() < 1e-9);

        // Target to the left, turn first
        let target = Pose::planar(Frame::World, Frame::Robot, 0.0, 4.0, 0.0);
        let track = planner.plan_approach(&current, &target).unwrap();
        assert_eq!(track.segments().len(), 2);
        assert!(matches!(
            track.segments()[0].kind,
            SegmentKind::Turn { angle_rad } if (angle_rad - FRAC_PI_2).abs() < 1e-9
        ));
        assert!((track.end_pose().unwrap().position2() - Vector2::new(0.0, 2.8)).norm() < 1e-9);

        // Generations always increase
        assert_eq!(track.generation(), 1);
    }

    #[test]
    fn test_plan_approach_within_offset() {
        let mut planner = planner();
        let current = Pose::planar(Frame::World, Frame::Robot, 0.0, 0.0, 0.0);
        let target = Pose::planar(Frame::World, Frame::Robot, 0.8, 0.0, 0.0);

        // Backs off to the offset, still facing the target
        let track = planner.plan_approach(&current, &target).unwrap();
        assert!(matches!(
            track.segments()[0].kind,
            SegmentKind::Reverse { length_m } if close(length_m, 0.4)
        ));
        let end = track.end_pose().unwrap();
        assert!((end.position2() - Vector2::new(-0.4, 0.0)).norm() < 1e-9);
        assert!(end.heading().abs() < 1e-9);

        // Exactly at the offset, turns to face the target without moving
        let current = Pose::planar(Frame::World, Frame::Robot, -2.0, 0.0, 0.9);
        let target = Pose::planar(Frame::World, Frame::Robot, -0.8, 0.0, 0.0);
        let track = planner.plan_approach(&current, &target).unwrap();
        let end = track.end_pose().unwrap();
        assert!((end.position2() - Vector2::new(-2.0, 0.0)).norm() < 1e-9);
        assert!(end.heading().abs() < 1e-9);
        assert!(track
            .poses()
            .all(|p| (p.position2() - Vector2::new(-2.0, 0.0)).norm() < 1e-9));

        // On top of the target, backs off along its heading
        let current = Pose::planar(Frame::World, Frame::Robot, 1.0, 1.0, FRAC_PI_2);
        let target = Pose::planar(Frame::World, Frame::Robot, 1.0, 1.0, FRAC_PI_2);
        let track = planner.plan_approach(&current, &target).unwrap();
        let end = track.end_pose().unwrap();
        assert!((end.position2() - Vector2::new(1.0, -0.2)).norm() < 1e-9);
        assert!((end.heading() - FRAC_PI_2).abs() < 1e-9);
    }

    #[test]
    fn test_plan_refinement() {
        let mut planner = planner();
        let current = Pose::planar(Frame::World, Frame::Robot, 3.8, 0.0, 0.0);
        let target = Pose::planar(Frame::World, Frame::Robot, 5.0, 0.0, FRAC_PI_2);

        let track = planner.plan_refinement(&current, &target).unwrap();
        let end = track.end_pose().unwrap();
        assert!((end.position2() - target.position2()).norm() < 1e-9);
        assert!((end.heading() - FRAC_PI_2).abs() < 1e-9);

        // Already there
        let track = planner.plan_refinement(&target, &target).unwrap();
        assert_eq!(track.num_points(), 1);
    }

    #[test]
    fn test_plan_refinement_ends_at_target_heading() {
        let mut planner = planner();

        // Slightly off the line of travel, well inside the heading tolerance
        let current = Pose::planar(Frame::World, Frame::Robot, 0.0, 0.0, 0.0);
        let target = Pose::planar(Frame::World, Frame::Robot, 1.3, -0.05, 0.0);

        let track = planner.plan_refinement(&current, &target).unwrap();
        let end = track.end_pose().unwrap();
        assert!((end.position2() - target.position2()).norm() < 1e-9);
        assert!(heading_delta(end.heading(), target.heading()).abs() < 1e-9);

        // The straight is driven along the line of travel, then a small turn squares up
        assert!(matches!(
            track.segments().last().unwrap().kind,
            SegmentKind::Turn { angle_rad } if angle_rad > 0.0 && angle_rad < 0.05
        ));
    }

    #[test]
    fn test_plan_row_turn_left() {
        let mut planner = planner();
        let current = Pose::planar(Frame::World, Frame::Robot, 10.0, 0.0, 0.0);

        let track = planner
            .plan_row_turn(&current, 1.0, TurnDirection::Left)
            .unwrap();
        let segs = track.segments();
        assert_eq!(segs.len(), 4);

        assert!(matches!(
            segs[0].kind,
            SegmentKind::Straight { length_m } if close(length_m, 1.5)
        ));
        assert!(matches!(
            segs[1].kind,
            SegmentKind::Turn { angle_rad } if close(angle_rad, FRAC_PI_2)
        ));
        assert!(matches!(
            segs[2].kind,
            SegmentKind::Lateral { length_m, side: TurnDirection::Left } if close(length_m, 1.0)
        ));
        assert!(matches!(
            segs[3].kind,
            SegmentKind::Turn { angle_rad } if close(angle_rad, FRAC_PI_2)
        ));

        // Lateral crossing goes to the left (+Y) of the original heading
        let lat_end = segs[2].poses.last().unwrap();
        assert!((lat_end.position2() - Vector2::new(11.5, 1.0)).norm() < 1e-9);

        // Facing back down the next row
        let end = track.end_pose().unwrap();
        assert!((end.heading().abs() - std::f64::consts::PI).abs() < 1e-9);
    }

    #[test]
    fn test_plan_row_turn_right() {
        let mut planner = planner();
        let current = Pose::planar(Frame::World, Frame::Robot, 0.0, 0.0, 0.0);

        let track = planner
            .plan_row_turn(&current, 2.0, TurnDirection::Right)
            .unwrap();
        let segs = track.segments();
        assert!(matches!(
            segs[1].kind,
            SegmentKind::Turn { angle_rad } if close(angle_rad, -FRAC_PI_2)
        ));
        let lat_end = segs[2].poses.last().unwrap();
        assert!((lat_end.position2() - Vector2::new(1.5, -2.0)).norm() < 1e-9);
    }
}
