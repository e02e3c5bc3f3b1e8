//! # Waypoints
//!
//! The surveyed hole positions the mission visits, in order. Holes are laid out in rows, and the
//! robot turns onto the next row after the last hole of each row.
//!
//! Waypoints are loaded from a CSV file with the columns:
//!
//! - `dx` - offset east of the survey origin in meters
//! - `dy` - offset north of the survey origin in meters
//! - `yaw_deg` (optional) - heading of the robot at the hole in the world frame
//! - `row` (optional) - index of the row the hole belongs to
//!
//! If `row` is not given rows can be derived from a fixed number of holes per row. Missing
//! headings are inferred from the direction of the row.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{io::Read, path::Path};

use log::{info, warn};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use super::loc::{transforms::survey_to_world, Frame, Pose};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A single hole to visit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waypoint {
    /// Position of the waypoint in the set
    pub index: usize,

    /// Row the waypoint belongs to
    pub row: usize,

    pub row_position: RowPosition,

    /// Position of the hole in the world frame
    pub position_m: Vector2<f64>,

    /// Heading the robot should have at the hole in the world frame
    pub heading_rad: f64,
}

/// The ordered, immutable set of waypoints of a mission.
#[derive(Debug, Clone)]
pub struct WaypointSet {
    waypoints: Vec<Waypoint>,
}

/// A row of the survey file.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SurveyPoint {
    pub dx: f64,
    pub dy: f64,

    #[serde(default)]
    pub yaw_deg: Option<f64>,

    #[serde(default)]
    pub row: Option<usize>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowPosition {
    Normal,

    /// The last waypoint of its row
    LastInRow,
}

#[derive(Debug, thiserror::Error)]
pub enum WaypointError {
    #[error("The waypoint set is empty")]
    Empty,

    #[error("Could not read the waypoint file: {0}")]
    Csv(#[from] csv::Error),

    #[error("Waypoint {0} has no row but others do")]
    MissingRow(usize),

    #[error("Waypoint {0} is in an earlier row than the waypoint before it")]
    RowsOutOfOrder(usize),

    #[error("Row length must be at least 1")]
    InvalidRowLength,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Waypoint {
    /// Pose of the hole in the world frame.
    pub fn hole_pose(&self) -> Pose {
        Pose::planar(
            Frame::World,
            Frame::Hole,
            self.position_m.x,
            self.position_m.y,
            self.heading_rad,
        )
    }

    pub fn is_last_in_row(&self) -> bool {
        self.row_position == RowPosition::LastInRow
    }
}

impl WaypointSet {
    /// Load a waypoint set from a CSV file.
    pub fn from_csv<P: AsRef<Path>>(
        path: P,
        row_length: Option<usize>,
    ) -> Result<Self, WaypointError> {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path.as_ref())?;

        let set = Self::from_csv_reader(reader, row_length)?;
        info!(
            "Loaded {} waypoints in {} rows from {}",
            set.len(),
            set.num_rows(),
            path.as_ref().display()
        );
        Ok(set)
    }

    /// Load a waypoint set from CSV data.
    pub fn from_reader<R: Read>(rdr: R, row_length: Option<usize>) -> Result<Self, WaypointError> {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(rdr);

        Self::from_csv_reader(reader, row_length)
    }

    fn from_csv_reader<R: Read>(
        mut reader: csv::Reader<R>,
        row_length: Option<usize>,
    ) -> Result<Self, WaypointError> {
        let points = reader
            .deserialize()
            .collect::<Result<Vec<SurveyPoint>, _>>()?;

        Self::from_survey(&points, row_length)
    }

    /// Build a waypoint set from survey points.
    ///
    /// Rows are taken from the points if given, otherwise every `row_length` points form a row,
    /// otherwise all points are in a single row.
    pub fn from_survey(
        points: &[SurveyPoint],
        row_length: Option<usize>,
    ) -> Result<Self, WaypointError> {
        if points.is_empty() {
            return Err(WaypointError::Empty);
        }

        let rows = assign_rows(points, row_length)?;
        let positions: Vec<Vector2<f64>> = points
            .iter()
            .map(|p| survey_to_world(p.dx, p.dy))
            .collect();

        let waypoints = (0..points.len())
            .map(|i| {
                let row = rows[i];
                let last_in_row = rows.get(i + 1).map(|&r| r != row).unwrap_or(true);

                let heading_rad = match points[i].yaw_deg {
                    Some(yaw) => yaw.to_radians(),
                    None => infer_heading(&positions, &rows, i),
                };

                Waypoint {
                    index: i,
                    row,
                    row_position: if last_in_row {
                        RowPosition::LastInRow
                    } else {
                        RowPosition::Normal
                    },
                    position_m: positions[i],
                    heading_rad,
                }
            })
            .collect();

        Ok(Self { waypoints })
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Waypoint> {
        self.waypoints.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Waypoint> {
        self.waypoints.iter()
    }

    /// Number of distinct rows.
    pub fn num_rows(&self) -> usize {
        self.waypoints
            .iter()
            .filter(|w| w.is_last_in_row())
            .count()
    }
}

fn assign_rows(
    points: &[SurveyPoint],
    row_length: Option<usize>,
) -> Result<Vec<usize>, WaypointError> {
    if points.iter().any(|p| p.row.is_some()) {
        let mut rows = Vec::with_capacity(points.len());
        for (i, p) in points.iter().enumerate() {
            let row = p.row.ok_or(WaypointError::MissingRow(i))?;
            if rows.last().map(|&r| row < r).unwrap_or(false) {
                return Err(WaypointError::RowsOutOfOrder(i));
            }
            rows.push(row);
        }
        return Ok(rows);
    }

    match row_length {
        Some(0) => Err(WaypointError::InvalidRowLength),
        Some(n) => Ok((0..points.len()).map(|i| i / n).collect()),
        None => Ok(vec![0; points.len()]),
    }
}

/// Heading along the row at waypoint `i`, looking forward to the next waypoint in the row or back
/// from the previous one for the last in the row.
fn infer_heading(positions: &[Vector2<f64>], rows: &[usize], i: usize) -> f64 {
    let same_row = |j: usize| rows.get(j).map(|&r| r == rows[i]).unwrap_or(false);

    let diff = if same_row(i + 1) {
        positions[i + 1] - positions[i]
    } else if i > 0 && same_row(i - 1) {
        positions[i] - positions[i - 1]
    } else {
        warn!("Waypoint {} is alone in its row, heading set to 0", i);
        return 0.0;
    };

    diff.y.atan2(diff.x)
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
