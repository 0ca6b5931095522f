//! Headless viewer: keeps the published map in memory and persists it as a
//! point cloud.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::message::{CloudPoint, KeyframeMessage};
use super::{MapPublisher, OutputWrapper, Viewer};
use crate::error::Result;

/// Display messages buffered between the mapper and the viewer loop.
pub const DISPLAY_QUEUE: usize = 10;

/// Latest version of every published keyframe.
#[derive(Default)]
pub struct PointCloud {
    keyframes: BTreeMap<usize, KeyframeMessage>,
}

impl PointCloud {
    pub fn insert(&mut self, keyframe: KeyframeMessage) {
        self.keyframes.insert(keyframe.id, keyframe);
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyframeMessage> {
        self.keyframes.values()
    }

    pub fn points(&self) -> impl Iterator<Item = &CloudPoint> {
        self.keyframes.values().flat_map(|kf| kf.points.iter())
    }

    pub fn len(&self) -> usize {
        self.points().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// ASCII PLY with a gray color per vertex.
    pub fn write_ply(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "ply")?;
        writeln!(out, "format ascii 1.0")?;
        writeln!(out, "element vertex {}", self.len())?;
        for axis in ["x", "y", "z"] {
            writeln!(out, "property float {axis}")?;
        }
        for channel in ["red", "green", "blue"] {
            writeln!(out, "property uchar {channel}")?;
        }
        writeln!(out, "end_header")?;
        for p in self.points() {
            let [x, y, z] = p.position;
            let c = p.intensity;
            writeln!(out, "{x} {y} {z} {c} {c} {c}")?;
        }
        out.flush()?;
        info!("saved {} points to {path:?}", self.len());
        Ok(())
    }
}

pub struct CloudViewer {
    cloud: Arc<Mutex<PointCloud>>,
    display_tx: Sender<KeyframeMessage>,
    display_rx: Receiver<KeyframeMessage>,
    shutdown_tx: Sender<()>,
    shutdown_rx: Receiver<()>,
}

impl CloudViewer {
    pub fn new() -> Self {
        let (display_tx, display_rx) = bounded(DISPLAY_QUEUE);
        let (shutdown_tx, shutdown_rx) = bounded(1);
        Self {
            cloud: Arc::new(Mutex::new(PointCloud::default())),
            display_tx,
            display_rx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn cloud(&self) -> Arc<Mutex<PointCloud>> {
        Arc::clone(&self.cloud)
    }
}

impl Default for CloudViewer {
    fn default() -> Self {
        Self::new()
    }
}

impl Viewer for CloudViewer {
    fn publisher(&self) -> Box<dyn OutputWrapper> {
        Box::new(MapPublisher::new(self.cloud(), self.display_tx.clone()))
    }

    fn requires_foreground(&self) -> bool {
        false
    }

    fn run(&self) {
        let mut shown = 0usize;
        loop {
            select! {
                recv(self.display_rx) -> msg => match msg {
                    Ok(keyframe) => {
                        shown += 1;
                        debug!(
                            "keyframe {} at {:?}, {} points",
                            keyframe.id,
                            keyframe.position(),
                            keyframe.points.len()
                        );
                    }
                    Err(_) => break,
                },
                recv(self.shutdown_rx) -> _ => break,
            }
        }
        debug!("viewer closed after {shown} keyframe updates");
    }

    fn close(&self) {
        let _ = self.shutdown_tx.try_send(());
    }

    fn save_as_ply(&self, path: &Path) -> Result<()> {
        self.cloud.lock().write_ply(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra as na;
    use std::fs;
    use std::thread;

    fn keyframe(id: usize, x: f64, points: usize) -> KeyframeMessage {
        KeyframeMessage {
            id,
            frame_id: id * 2,
            timestamp: id as f64,
            pose: na::Isometry3::translation(x, 0.0, 0.0),
            points: (0..points)
                .map(|i| CloudPoint {
                    position: [x as f32, i as f32, 1.0],
                    intensity: 50 + i as u8,
                })
                .collect(),
        }
    }

    #[test]
    fn republished_keyframes_replace_old_points() {
        let viewer = CloudViewer::new();
        let mut publisher = viewer.publisher();
        publisher.publish_keyframe(&keyframe(0, 0.0, 3));
        publisher.publish_keyframe(&keyframe(1, 1.0, 2));
        publisher.publish_keyframe(&keyframe(1, 5.0, 2));

        let cloud = viewer.cloud();
        let cloud = cloud.lock();
        assert_eq!(cloud.len(), 5);
        assert!(cloud.points().any(|p| p.position[0] == 5.0));
        assert!(!cloud.points().any(|p| p.position[0] == 1.0));
    }

    #[test]
    fn writes_ascii_ply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pointcloud.ply");
        let viewer = CloudViewer::new();
        viewer.publisher().publish_keyframe(&keyframe(0, 2.0, 2));
        viewer.save_as_ply(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "ply");
        assert_eq!(lines[2], "element vertex 2");
        let header_end = lines.iter().position(|l| *l == "end_header").unwrap();
        assert_eq!(&lines[header_end + 1..], &["2 0 1 50 50 50", "2 1 1 51 51 51"]);
    }

    #[test]
    fn run_returns_after_close() {
        let viewer = Arc::new(CloudViewer::new());
        let runner = {
            let viewer = Arc::clone(&viewer);
            thread::spawn(move || viewer.run())
        };
        for id in 0..(DISPLAY_QUEUE * 3) {
            viewer.publisher().publish_keyframe(&keyframe(id, 0.0, 1));
        }
        viewer.close();
        viewer.close();
        runner.join().unwrap();
        assert_eq!(viewer.cloud().lock().keyframes().count(), DISPLAY_QUEUE * 3);
    }
}
