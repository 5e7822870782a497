//! Parametric camera rig model and pixel-to-ray conversion.
//!
//! The rig is a fixed circular arrangement: cameras sit on a horizontal
//! circle of radius `camera_distance` around the vertical axis, all at
//! height 0, each aimed at the origin. A camera is identified by its
//! azimuth in degrees on that circle (the session `angle_id`).
//!
//! The model is deliberately uncalibrated: no lens distortion and no pose
//! estimation beyond the circle assumption. Real-world placement error is
//! not modeled out, which bounds the achievable accuracy.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// A 3D ray in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    /// Ray start point (camera position).
    pub origin: Vector3<f64>,
    /// Unit direction vector.
    pub direction: Vector3<f64>,
}

impl Ray {
    /// Perpendicular distance from `point` to this ray.
    pub fn distance_to_point(&self, point: &Vector3<f64>) -> f64 {
        let to_point = point - self.origin;
        let along = to_point.dot(&self.direction);
        (to_point - self.direction * along).norm()
    }
}

/// Assumed camera placement for the capture rig.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CameraRigModel {
    /// Distance from each camera to the rig center (meters).
    pub camera_distance: f64,
    /// Camera image width in pixels.
    pub image_width: u32,
    /// Camera image height in pixels.
    pub image_height: u32,
    /// Horizontal field of view in radians.
    pub fov_horizontal: f64,
}

impl Default for CameraRigModel {
    fn default() -> Self {
        Self {
            camera_distance: 2.0,
            image_width: 640,
            image_height: 480,
            fov_horizontal: 60.0_f64.to_radians(),
        }
    }
}

impl CameraRigModel {
    /// Construct a rig model with the FOV given in degrees.
    pub fn new(camera_distance: f64, image_width: u32, image_height: u32, fov_deg: f64) -> Self {
        Self {
            camera_distance,
            image_width,
            image_height,
            fov_horizontal: fov_deg.to_radians(),
        }
    }

    /// Focal length in pixels, derived from the horizontal FOV.
    pub fn focal_length(&self) -> f64 {
        (self.image_width as f64 / 2.0) / (self.fov_horizontal / 2.0).tan()
    }

    /// Camera position on the rig circle for the given azimuth (degrees).
    ///
    /// Cameras lie in the Z=0 plane; Z is up.
    pub fn camera_position(&self, angle_deg: f64) -> Vector3<f64> {
        let a = angle_deg.to_radians();
        Vector3::new(
            self.camera_distance * a.cos(),
            self.camera_distance * a.sin(),
            0.0,
        )
    }

    /// Convert a pixel coordinate seen by the camera at `angle_deg` into a
    /// world-space ray.
    ///
    /// Pixels are normalized to [-1, 1] about the image center with Y
    /// flipped so image-up maps to +Y in camera-local space, then scaled by
    /// the half-FOV tangent (Y additionally by the aspect ratio). The
    /// camera looks along its local −Z toward the origin; local axes map to
    /// world as right → (−sin a, cos a, 0), up → (0, 0, 1),
    /// forward → (−cos a, −sin a, 0).
    pub fn pixel_to_ray(&self, pixel_x: f64, pixel_y: f64, angle_deg: f64) -> Ray {
        let half_w = self.image_width as f64 / 2.0;
        let half_h = self.image_height as f64 / 2.0;
        let norm_x = (pixel_x - half_w) / half_w;
        let norm_y = -(pixel_y - half_h) / half_h;

        let half_tan = (self.fov_horizontal / 2.0).tan();
        let aspect = self.image_height as f64 / self.image_width as f64;
        let local = Vector3::new(norm_x * half_tan, norm_y * half_tan * aspect, -1.0).normalize();

        let a = angle_deg.to_radians();
        let (sin_a, cos_a) = a.sin_cos();
        let world = Vector3::new(
            -local.x * sin_a + local.z * cos_a,
            local.x * cos_a + local.z * sin_a,
            local.y,
        )
        .normalize();

        Ray {
            origin: self.camera_position(angle_deg),
            direction: world,
        }
    }

    /// Project a world point into pixel coordinates for the camera at
    /// `angle_deg`. Returns `None` if the point is behind the camera.
    ///
    /// Exact inverse of [`pixel_to_ray`](Self::pixel_to_ray); used for
    /// reprojection checks.
    pub fn project_point(&self, point: &Vector3<f64>, angle_deg: f64) -> Option<(f64, f64)> {
        let a = angle_deg.to_radians();
        let (sin_a, cos_a) = a.sin_cos();
        let rel = point - self.camera_position(angle_deg);

        // World → camera-local: rows are the camera basis vectors.
        let local_x = -rel.x * sin_a + rel.y * cos_a;
        let local_y = rel.z;
        let local_z = rel.x * cos_a + rel.y * sin_a;
        if local_z >= 0.0 {
            return None;
        }

        let half_tan = (self.fov_horizontal / 2.0).tan();
        let aspect = self.image_height as f64 / self.image_width as f64;
        let norm_x = (local_x / -local_z) / half_tan;
        let norm_y = (local_y / -local_z) / (half_tan * aspect);

        let half_w = self.image_width as f64 / 2.0;
        let half_h = self.image_height as f64 / 2.0;
        Some((norm_x * half_w + half_w, -norm_y * half_h + half_h))
    }
}
