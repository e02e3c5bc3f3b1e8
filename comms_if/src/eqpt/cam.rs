//! # Camera Equipment Communications Module
//!
//! Detections produced by the camera/inference service. The inference engine itself is external,
//! the mission only consumes its output.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{serde::ts_milliseconds, DateTime, Utc};
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A single object detection from one camera frame.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Detection {
    /// Camera which produced the frame
    pub cam_id: CamId,

    /// UTC timestamp at which the frame was captured
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Class label assigned by the detector
    pub class: String,

    /// Confidence of the class assignment, in [0, 1]
    pub confidence: f64,

    /// Bounding box in normalised image coordinates
    pub bbox: BoundingBox,

    /// Depth sample at the box centroid from the stereo pair, in meters, if one was valid
    pub depth_m: Option<f64>,
}

/// Bounding box in normalised image coordinates, origin at the top left of the image.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x_norm: f64,
    pub y_norm: f64,
    pub width_norm: f64,
    pub height_norm: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Cameras available on the robot
#[derive(Debug, Serialize, Deserialize, Copy, Clone, Hash, Eq, PartialEq)]
pub enum CamId {
    /// Forward facing camera used to find the hole from the search zone
    Forward,

    /// Downward facing camera used to align tools over the hole
    Downward,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl BoundingBox {
    /// Get the centre of the box in normalised image coordinates.
    pub fn centroid(&self) -> (f64, f64) {
        (
            self.x_norm + self.width_norm / 2.0,
            self.y_norm + self.height_norm / 2.0,
        )
    }

    /// Build a box of the given size centred on the point.
    pub fn centred_on(x_norm: f64, y_norm: f64, width_norm: f64, height_norm: f64) -> Self {
        Self {
            x_norm: x_norm - width_norm / 2.0,
            y_norm: y_norm - height_norm / 2.0,
            width_norm,
            height_norm,
        }
    }
}

impl std::fmt::Display for CamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CamId::Forward => write!(f, "forward"),
            CamId::Downward => write!(f, "downward"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_centroid() {
        let bbox = BoundingBox::centred_on(0.25, 0.75, 0.1, 0.2);
        let (x, y) = bbox.centroid();

        assert!((x - 0.25).abs() < 1e-12);
        assert!((y - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_detection_timestamp_is_millis() {
        let det = Detection {
            cam_id: CamId::Forward,
            timestamp: DateTime::parse_from_rfc3339("2024-05-01T10:00:00.250Z")
                .unwrap()
                .with_timezone(&Utc),
            class: String::from("hole"),
            confidence: 0.9,
            bbox: BoundingBox::centred_on(0.5, 0.5, 0.1, 0.1),
            depth_m: Some(1.2),
        };

        let json = serde_json::to_value(&det).unwrap();
        assert_eq!(json["timestamp"], serde_json::json!(1714557600250i64));
    }
}
