use nalgebra as na;

use super::keyframe::*;

pub type MapPointId = usize;

pub struct MapPoint {
    pub id: MapPointId,
    pub host: KeyFrameId,
    /// Pixel in the host keyframe it was selected at.
    pub pixel: (f32, f32),
    /// Position in the host camera frame.
    pub position: na::Vector3<f64>,
    pub intensity: u8,
    pub active: bool,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        host: KeyFrameId,
        pixel: (f32, f32),
        position: na::Vector3<f64>,
        intensity: u8,
    ) -> Self {
        MapPoint {
            id,
            host,
            pixel,
            position,
            intensity,
            active: true,
        }
    }

    pub fn world_position(&self, host_pose: &na::Isometry3<f64>) -> na::Point3<f64> {
        host_pose * na::Point3::from(self.position)
    }
}
