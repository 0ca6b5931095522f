use nalgebra as na;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CloudPoint {
    pub position: [f32; 3],
    pub intensity: u8,
}

/// A mapped keyframe as shown by the viewer: its pose and the world
/// positions of the points it hosts. Published again whenever loop closing
/// moves the keyframe.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyframeMessage {
    pub id: usize,
    pub frame_id: usize,
    pub timestamp: f64,
    pub pose: na::Isometry3<f64>,
    pub points: Vec<CloudPoint>,
}

impl KeyframeMessage {
    pub fn position(&self) -> [f32; 3] {
        let t = &self.pose.translation.vector;
        [t.x as f32, t.y as f32, t.z as f32]
    }

    /// Orientation as `[x, y, z, w]`.
    pub fn rotation(&self) -> [f32; 4] {
        let q = &self.pose.rotation;
        [q.i as f32, q.j as f32, q.k as f32, q.w as f32]
    }
}
