//! # Camera calibration
//!
//! Pinhole intrinsics and mounting extrinsics of a camera, used to turn an image detection plus
//! its depth into a 3D point.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use serde::Deserialize;

use crate::auto::loc::{Frame, Pose};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CamCalibration {
    /// Image width in pixels
    pub width_px: f64,

    /// Image height in pixels
    pub height_px: f64,

    /// Focal length along the image X axis in pixels
    pub fx_px: f64,

    /// Focal length along the image Y axis in pixels
    pub fy_px: f64,

    /// Principal point X in pixels
    pub cx_px: f64,

    /// Principal point Y in pixels
    pub cy_px: f64,

    /// Position of the camera in the robot frame
    pub position_m_rb: [f64; 3],

    /// Downwards tilt of the optical axis from the robot's forward axis
    pub pitch_down_rad: f64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl CamCalibration {
    /// Back-project a point in normalised image coordinates at the given depth into the camera
    /// optical frame.
    pub fn pixel_to_camera(&self, u_norm: f64, v_norm: f64, depth_m: f64) -> Vector3<f64> {
        let u = u_norm * self.width_px;
        let v = v_norm * self.height_px;

        Vector3::new(
            (u - self.cx_px) * depth_m / self.fx_px,
            (v - self.cy_px) * depth_m / self.fy_px,
            depth_m,
        )
    }

    /// Project a point in the camera optical frame into normalised image coordinates, returning
    /// the coordinates and the depth of the point.
    ///
    /// Returns `None` if the point is behind the camera or outside the image.
    pub fn camera_to_pixel(&self, point_m: &Vector3<f64>) -> Option<(f64, f64, f64)> {
        if point_m.z <= 0.0 {
            return None;
        }

        let u = self.fx_px * point_m.x / point_m.z + self.cx_px;
        let v = self.fy_px * point_m.y / point_m.z + self.cy_px;

        let (u_norm, v_norm) = (u / self.width_px, v / self.height_px);
        if !(0.0..=1.0).contains(&u_norm) || !(0.0..=1.0).contains(&v_norm) {
            return None;
        }

        Some((u_norm, v_norm, point_m.z))
    }

    /// Pose of the camera optical frame in the robot frame.
    pub fn robot_from_camera(&self) -> Pose {
        // Optical frame is X right, Y down, Z forward
        #[rustfmt::skip]
        let align = Rotation3::from_matrix_unchecked(Matrix3::new(
             0.0,  0.0, 1.0,
            -1.0,  0.0, 0.0,
             0.0, -1.0, 0.0,
        ));
        let tilt = Rotation3::from_axis_angle(&Vector3::y_axis(), self.pitch_down_rad);

        Pose {
            frame: Frame::Robot,
            body: Frame::Camera,
            position_m: Vector3::from(self.position_m_rb),
            attitude_q: UnitQuaternion::from_rotation_matrix(&(tilt * align)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn calib() -> CamCalibration {
        CamCalibration {
            width_px: 640.0,
            height_px: 480.0,
            fx_px: 500.0,
            fy_px: 500.0,
            cx_px: 320.0,
            cy_px: 240.0,
            position_m_rb: [0.3, 0.0, 1.0],
            pitch_down_rad: 0.0,
        }
    }

    #[test]
    fn test_pixel_to_camera() {
        let c = calib();

        // Principal point lies on the optical axis
        let p = c.pixel_to_camera(0.5, 0.5, 2.0);
        assert!((p - Vector3::new(0.0, 0.0, 2.0)).norm() < 1e-12);

        // 100 px right of centre at 5 m
        let p = c.pixel_to_camera(420.0 / 640.0, 0.5, 5.0);
        assert!((p.x - 1.0).abs() < 1e-12);

        let (u, v, z) = c.camera_to_pixel(&p).unwrap();
        assert!((u - 420.0 / 640.0).abs() < 1e-12);
        assert!((v - 0.5).abs() < 1e-12);
        assert!((z - 5.0).abs() < 1e-12);

        assert!(c.camera_to_pixel(&Vector3::new(0.0, 0.0, -1.0)).is_none());
        assert!(c.camera_to_pixel(&Vector3::new(10.0, 0.0, 1.0)).is_none());
    }

    #[test]
    fn test_robot_from_camera() {
        let c = calib();
        let robot_from_camera = c.robot_from_camera();

        // Straight ahead of the camera is straight ahead of the robot
        let p = robot_from_camera.transform_point(&Vector3::new(0.0, 0.0, 2.0));
        assert!((p - Vector3::new(2.3, 0.0, 1.0)).norm() < 1e-9);

        // Right in the image is right of the robot
        let p = robot_from_camera.transform_point(&Vector3::new(1.0, 0.0, 0.0));
        assert!((p - Vector3::new(0.3, -1.0, 1.0)).norm() < 1e-9);

        // Tilted down, the optical axis points below the horizon
        let c = CamCalibration {
            pitch_down_rad: 0.5,
            ..calib()
        };
        let p = c.robot_from_camera().transform_point(&Vector3::new(0.0, 0.0, 1.0));
        assert!(p.z < 1.0);
        assert!(p.x > 0.3);
    }
}
