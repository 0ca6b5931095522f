pub mod cloud;
pub mod message;
#[cfg(feature = "viewer")]
pub mod process_msg;

use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::info;

use crate::error::Result;
use crate::settings::OperatingProfile;
use cloud::PointCloud;
use message::KeyframeMessage;

/// Sink for map updates produced by the mapping engine.
pub trait OutputWrapper: Send {
    fn publish_keyframe(&mut self, keyframe: &KeyframeMessage);
}

/// Map display attached to a run.
///
/// `run` blocks until `close` is called (or the display is closed by the
/// user). Viewers that must own the calling thread report it through
/// `requires_foreground`; the others are run on a worker thread.
pub trait Viewer: Send + Sync {
    fn publisher(&self) -> Box<dyn OutputWrapper>;
    fn requires_foreground(&self) -> bool;
    fn run(&self);
    fn close(&self);
    fn save_as_ply(&self, path: &Path) -> Result<()>;
}

/// Feeds the shared point cloud and wakes the display.
pub struct MapPublisher {
    cloud: Arc<Mutex<PointCloud>>,
    display: Sender<KeyframeMessage>,
}

impl MapPublisher {
    pub fn new(cloud: Arc<Mutex<PointCloud>>, display: Sender<KeyframeMessage>) -> Self {
        Self { cloud, display }
    }
}

impl OutputWrapper for MapPublisher {
    fn publish_keyframe(&mut self, keyframe: &KeyframeMessage) {
        self.cloud.lock().insert(keyframe.clone());
        // a busy display skips updates, the cloud is complete regardless
        let _ = self.display.try_send(keyframe.clone());
    }
}

/// Logs every published keyframe.
#[derive(Default)]
pub struct SampleOutputWrapper {
    published: usize,
}

impl OutputWrapper for SampleOutputWrapper {
    fn publish_keyframe(&mut self, keyframe: &KeyframeMessage) {
        self.published += 1;
        let [x, y, z] = keyframe.position();
        info!(
            "OUT: keyframe {} (frame {}, t={:.3}) at ({x:.3}, {y:.3}, {z:.3}) with {} points, {} updates so far",
            keyframe.id,
            keyframe.frame_id,
            keyframe.timestamp,
            keyframe.points.len(),
            self.published
        );
    }
}

/// The viewer for this build, `None` when visualization is disabled.
pub fn create_viewer(
    profile: &OperatingProfile,
    width: u32,
    height: u32,
) -> Option<Box<dyn Viewer>> {
    if !profile.toggles.visualization {
        return None;
    }

    #[cfg(feature = "viewer")]
    {
        Some(Box::new(process_msg::BevyViewer::new(width, height)))
    }
    #[cfg(not(feature = "viewer"))]
    {
        info!("headless map viewer for {width}x{height} frames");
        Some(Box::new(cloud::CloudViewer::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings;

    #[test]
    fn no_viewer_without_visualization() {
        let profile = settings::resolve(None, ["nogui=1"]).unwrap();
        assert!(create_viewer(&profile, 64, 48).is_none());
        let profile = settings::resolve(None, ["nogui=0"]).unwrap();
        assert!(create_viewer(&profile, 64, 48).is_some());
    }
}
