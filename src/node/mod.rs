pub mod coordinator;
pub mod exporter;
pub mod pipeline;
pub mod transport;

pub use coordinator::{launch, launch_with, Node, Phase, RunReport};

#[cfg(test)]
pub(crate) mod testing {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use image::{GrayImage, Luma};
    use parking_lot::Mutex;

    use crate::error::{Result, SlamError};
    use crate::slam::camera::{CameraCalibration, CameraIntrinsics, OutputRectification};
    use crate::slam::frame::{CorrectedFrame, RawFrame};
    use crate::slam::system::MappingEngine;
    use crate::slam::undistort::{UndistortOptions, Undistorter};

    pub const WIDTH: u32 = 16;
    pub const HEIGHT: u32 = 12;

    #[derive(Clone, Debug, PartialEq)]
    pub enum Event {
        Frame { sequence: usize, timestamp: f64 },
        Drain,
        Export(PathBuf, bool),
        ViewerClosed,
        PointCloud(PathBuf),
    }

    pub type EventLog = Arc<Mutex<Vec<Event>>>;

    pub fn undistorter() -> Undistorter {
        let calib = CameraCalibration {
            intrinsics: CameraIntrinsics::pinhole(20.0, 20.0, 7.5, 5.5),
            input_size: (WIDTH, HEIGHT),
            rectification: OutputRectification::None,
            output_size: (WIDTH, HEIGHT),
        };
        Undistorter::new(calib, None, &UndistortOptions::default()).unwrap()
    }

    pub fn gray_frame(timestamp: f64) -> RawFrame {
        RawFrame::new(GrayImage::from_pixel(WIDTH, HEIGHT, Luma([90])), timestamp)
    }

    /// Mapping engine double that records every call.
    #[derive(Default)]
    pub struct RecordingEngine {
        pub log: EventLog,
        pub fail_exports: bool,
    }

    impl RecordingEngine {
        pub fn with_log(log: EventLog) -> Self {
            Self {
                log,
                fail_exports: false,
            }
        }

        pub fn events(&self) -> Vec<Event> {
            self.log.lock().clone()
        }
    }

    impl MappingEngine for RecordingEngine {
        fn add_active_frame(&mut self, frame: CorrectedFrame, id: usize) {
            self.log.lock().push(Event::Frame {
                sequence: id,
                timestamp: frame.timestamp,
            });
        }

        fn block_until_mapping_is_finished(&mut self) {
            self.log.lock().push(Event::Drain);
        }

        fn export_trajectory(&mut self, path: &Path, apply_loop_correction: bool) -> Result<()> {
            self.log
                .lock()
                .push(Event::Export(path.to_path_buf(), apply_loop_correction));
            if self.fail_exports {
                return Err(SlamError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "read-only",
                )));
            }
            Ok(())
        }
    }
}
