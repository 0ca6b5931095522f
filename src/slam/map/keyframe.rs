use std::sync::Arc;

use nalgebra as na;

use super::super::process_image::ImagePyramid;
use super::super::vocabulary::BowVector;
use super::mappoint::*;

pub type KeyFrameId = usize;

#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,
    /// Sequence index of the frame this keyframe was made from.
    pub frame_id: usize,
    pub timestamp: f64,
    pub parent: Option<KeyFrameId>,
    /// Odometry pose, never touched by loop closing.
    pub pose: na::Isometry3<f64>,
    /// Pose with loop-closure corrections applied.
    pub corrected_pose: na::Isometry3<f64>,
    pub points: Vec<MapPointId>,
    pub bow: BowVector,
    /// Image data, dropped once the keyframe leaves the active window.
    pub pyramid: Option<Arc<ImagePyramid>>,
    pub connections: Vec<KeyFrameId>,
}

impl KeyFrame {
    pub fn new(
        id: KeyFrameId,
        frame_id: usize,
        timestamp: f64,
        parent: Option<KeyFrameId>,
        pose: na::Isometry3<f64>,
    ) -> Self {
        KeyFrame {
            id,
            frame_id,
            timestamp,
            parent,
            pose,
            corrected_pose: pose,
            points: Vec::new(),
            bow: BowVector::new(),
            pyramid: None,
            connections: Vec::new(),
        }
    }

    pub fn add_observation(&mut self, point: MapPointId) {
        self.points.push(point);
    }

    pub fn add_connection(&mut self, id: KeyFrameId) {
        if !self.connections.contains(&id) {
            self.connections.push(id);
        }
    }

    pub fn marginalize(&mut self) {
        self.pyramid = None;
    }
}
