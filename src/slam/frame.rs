use image::{DynamicImage, GrayImage};

use super::undistort::Undistorter;
use crate::settings::OperatingProfile;

/// A frame as delivered by a transport, before any correction.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub image: DynamicImage,
    /// Capture time in seconds.
    pub timestamp: f64,
}

impl RawFrame {
    pub fn new(image: GrayImage, timestamp: f64) -> Self {
        Self {
            image: DynamicImage::ImageLuma8(image),
            timestamp,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Undistorted, photometrically corrected frame handed to the mapping engine.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrectedFrame {
    pub width: u32,
    pub height: u32,
    /// Row-major irradiance values.
    pub pixels: Vec<f32>,
    pub exposure: f32,
    pub timestamp: f64,
}

impl CorrectedFrame {
    pub fn at(&self, x: u32, y: u32) -> f32 {
        self.pixels[(y * self.width + x) as usize]
    }
}

/// Per-frame adapter between the transport and the undistortion model.
pub struct FrameCorrector<'a> {
    undistorter: &'a Undistorter,
    photometric_level: u8,
}

impl<'a> FrameCorrector<'a> {
    pub fn new(undistorter: &'a Undistorter, profile: &OperatingProfile) -> Self {
        Self {
            undistorter,
            photometric_level: profile.photometric_mode.calibration_level(),
        }
    }

    /// Correct a raw frame. The frame must be single-channel 8-bit of the
    /// calibrated input size, anything else is a transport defect and panics.
    pub fn correct(&self, frame: RawFrame) -> CorrectedFrame {
        let DynamicImage::ImageLuma8(gray) = &frame.image else {
            panic!(
                "frame must be single-channel 8-bit, got {:?}",
                frame.image.color()
            );
        };
        self.undistorter
            .undistort(gray, self.photometric_level, 1.0, frame.timestamp, 1.0)
    }
}
